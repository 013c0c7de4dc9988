//! Presence tracking
//!
//! Presence is per logical user: one user with three devices has three
//! sessions but one status, the union of its sessions. The tracker keeps
//! the authoritative state in memory, mirrors per-session snapshots into
//! the store, and pushes every status change to registered listeners.
//!
//! Idle transitions (online -> away -> offline) are driven by [`sweep`],
//! which the engine runs on an interval.
//!
//! [`sweep`]: PresenceTracker::sweep

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tether_core::{PresenceChange, PresenceRecord, PresenceStatus};
use tether_store::{PresenceStore, SessionPresence};
use tokio::time::Instant;

use crate::error::EngineResult;

type PresenceListener = Arc<dyn Fn(&PresenceChange) + Send + Sync>;

/// In-memory presence state with durable per-session snapshots.
pub struct PresenceTracker {
    /// Authoritative record per user.
    users: DashMap<String, PresenceRecord>,
    /// Session ID to user ID.
    session_users: DashMap<String, String>,
    /// Last activity per user, on the runtime clock so tests can drive it.
    seen: DashMap<String, Instant>,
    listeners: RwLock<Vec<PresenceListener>>,
    store: PresenceStore,
    away_after: Duration,
    offline_after: Duration,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(store: PresenceStore, away_after: Duration, offline_after: Duration) -> Self {
        Self {
            users: DashMap::new(),
            session_users: DashMap::new(),
            seen: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            store,
            away_after,
            offline_after,
        }
    }

    /// Register a listener; listeners run synchronously in registration
    /// order on every status change.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&PresenceChange) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Bind a session to a user with an initial status.
    ///
    /// A change is emitted only when the user's status actually changes;
    /// a second device coming up for an already-online user is silent.
    pub async fn track(
        &self,
        session_id: &str,
        user_id: &str,
        status: PresenceStatus,
    ) -> EngineResult<()> {
        let change = {
            let mut entry = self
                .users
                .entry(user_id.to_string())
                .or_insert_with(|| PresenceRecord::new(user_id, PresenceStatus::Offline));
            let previous = entry.status;
            entry.add_session(session_id);
            entry.status = status;
            entry.touch();
            (previous != status).then(|| {
                PresenceChange::new(user_id, Some(session_id.to_string()), status)
            })
        };

        self.seen.insert(user_id.to_string(), Instant::now());
        self.session_users
            .insert(session_id.to_string(), user_id.to_string());

        self.store
            .save(session_id, &SessionPresence::new(user_id, status))
            .await?;
        self.store.beat(session_id).await?;

        if let Some(change) = &change {
            tracing::debug!(user_id = %user_id, session_id = %session_id, status = %status, "User tracked");
            self.notify(change);
        }
        Ok(())
    }

    /// Unbind a session; the user goes offline when it was the last one.
    pub async fn untrack(&self, session_id: &str) -> EngineResult<()> {
        let Some((_, user_id)) = self.session_users.remove(session_id) else {
            return Ok(());
        };

        let mut last = false;
        if let Some(mut entry) = self.users.get_mut(&user_id) {
            last = entry.remove_session(session_id);
        }
        if last {
            self.users.remove(&user_id);
            self.seen.remove(&user_id);
        }

        self.store.clear(session_id).await?;

        if last {
            tracing::debug!(user_id = %user_id, session_id = %session_id, "User offline");
            self.notify(&PresenceChange::new(
                user_id,
                Some(session_id.to_string()),
                PresenceStatus::Offline,
            ));
        }
        Ok(())
    }

    /// Record activity for the session's user.
    ///
    /// Promotes an away user back to online. Unknown sessions are a no-op.
    pub async fn heartbeat(&self, session_id: &str) -> EngineResult<()> {
        let Some(user_id) = self.session_users.get(session_id).map(|r| r.value().clone()) else {
            return Ok(());
        };

        self.seen.insert(user_id.clone(), Instant::now());
        let change = {
            let mut promoted = None;
            if let Some(mut entry) = self.users.get_mut(&user_id) {
                entry.touch();
                if entry.status == PresenceStatus::Away {
                    entry.status = PresenceStatus::Online;
                    promoted = Some(PresenceChange::new(
                        user_id.clone(),
                        Some(session_id.to_string()),
                        PresenceStatus::Online,
                    ));
                }
            }
            promoted
        };

        self.store.beat(session_id).await?;

        if let Some(change) = &change {
            self.notify(change);
        }
        Ok(())
    }

    /// Explicit status change from the client (e.g. busy / do-not-disturb).
    pub async fn set_status(&self, session_id: &str, status: PresenceStatus) -> EngineResult<()> {
        let Some(user_id) = self.session_users.get(session_id).map(|r| r.value().clone()) else {
            return Ok(());
        };

        let change = {
            let mut changed = None;
            if let Some(mut entry) = self.users.get_mut(&user_id) {
                if entry.status != status {
                    entry.status = status;
                    changed = Some(PresenceChange::new(
                        user_id.clone(),
                        Some(session_id.to_string()),
                        status,
                    ));
                }
                entry.touch();
            }
            changed
        };

        self.seen.insert(user_id.clone(), Instant::now());
        self.store
            .save(session_id, &SessionPresence::new(user_id.as_str(), status))
            .await?;

        if let Some(change) = &change {
            self.notify(change);
        }
        Ok(())
    }

    /// One pass of the idle state machine.
    ///
    /// Users idle past `away_after` go away; users idle past
    /// `offline_after` are dropped entirely, whatever their status, since
    /// no heartbeat for that long means every device is gone.
    pub async fn sweep(&self) -> EngineResult<Vec<PresenceChange>> {
        let now = Instant::now();
        let snapshot: Vec<(String, PresenceStatus, Duration)> = self
            .users
            .iter()
            .map(|entry| {
                let idle = self
                    .seen
                    .get(entry.key())
                    .map_or(Duration::ZERO, |seen| now.duration_since(*seen));
                (entry.key().clone(), entry.status, idle)
            })
            .collect();

        let mut changes = Vec::new();
        for (user_id, status, idle) in snapshot {
            if idle >= self.offline_after {
                let Some((_, record)) = self.users.remove(&user_id) else {
                    continue;
                };
                self.seen.remove(&user_id);
                for session_id in &record.sessions {
                    self.session_users.remove(session_id);
                    if let Err(e) = self.store.clear(session_id).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Presence clear failed");
                    }
                }
                tracing::debug!(user_id = %user_id, "Swept offline");
                changes.push(PresenceChange::new(user_id, None, PresenceStatus::Offline));
            } else if status == PresenceStatus::Online && idle >= self.away_after {
                let mut sessions = Vec::new();
                if let Some(mut entry) = self.users.get_mut(&user_id) {
                    if entry.status == PresenceStatus::Online {
                        entry.status = PresenceStatus::Away;
                        sessions = entry.sessions.clone();
                    }
                }
                if sessions.is_empty() {
                    continue;
                }
                for session_id in &sessions {
                    let snapshot = SessionPresence::new(user_id.as_str(), PresenceStatus::Away);
                    if let Err(e) = self.store.save(session_id, &snapshot).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Presence save failed");
                    }
                }
                changes.push(PresenceChange::new(user_id, None, PresenceStatus::Away));
            }
        }

        for change in &changes {
            self.notify(change);
        }
        Ok(changes)
    }

    /// Run [`sweep`](Self::sweep) forever on an interval.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(changes) if !changes.is_empty() => {
                        tracing::debug!(transitions = changes.len(), "Presence sweep");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Presence sweep failed"),
                }
            }
        })
    }

    /// Current status of a user, if tracked.
    #[must_use]
    pub fn status_of(&self, user_id: &str) -> Option<PresenceStatus> {
        self.users.get(user_id).map(|entry| entry.status)
    }

    /// Snapshot of every tracked user.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.users.iter().map(|entry| entry.value().clone()).collect()
    }

    /// The user a session is bound to.
    #[must_use]
    pub fn user_of(&self, session_id: &str) -> Option<String> {
        self.session_users.get(session_id).map(|r| r.value().clone())
    }

    /// Number of tracked users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn notify(&self, change: &PresenceChange) {
        let listeners: Vec<PresenceListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(change);
        }
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("users", &self.users.len())
            .field("sessions", &self.session_users.len())
            .field("away_after", &self.away_after)
            .field("offline_after", &self.offline_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tether_store::MemoryStore;

    fn tracker() -> (Arc<PresenceTracker>, Arc<Mutex<Vec<PresenceChange>>>) {
        let store = PresenceStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600));
        let tracker = Arc::new(PresenceTracker::new(
            store,
            Duration::from_secs(300),
            Duration::from_secs(600),
        ));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        tracker.add_listener(move |change| sink.lock().push(change.clone()));
        (tracker, changes)
    }

    #[tokio::test]
    async fn test_track_notifies_once_per_user() {
        let (tracker, changes) = tracker();

        tracker.track("s1", "u1", PresenceStatus::Online).await.unwrap();
        // Second device, same user: no transition.
        tracker.track("s2", "u1", PresenceStatus::Online).await.unwrap();

        let seen = changes.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, PresenceStatus::Online);
        assert_eq!(seen[0].user_id, "u1");
        drop(seen);

        assert_eq!(tracker.user_count(), 1);
        assert_eq!(tracker.status_of("u1"), Some(PresenceStatus::Online));
    }

    #[tokio::test]
    async fn test_untrack_goes_offline_on_last_session() {
        let (tracker, changes) = tracker();
        tracker.track("s1", "u1", PresenceStatus::Online).await.unwrap();
        tracker.track("s2", "u1", PresenceStatus::Online).await.unwrap();

        tracker.untrack("s1").await.unwrap();
        assert_eq!(tracker.status_of("u1"), Some(PresenceStatus::Online));

        tracker.untrack("s2").await.unwrap();
        assert_eq!(tracker.status_of("u1"), None);

        let seen = changes.lock();
        assert_eq!(seen.last().unwrap().status, PresenceStatus::Offline);
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_walks_idle_users_away_then_offline() {
        let (tracker, _changes) = tracker();
        tracker.track("s1", "u1", PresenceStatus::Online).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        let changes = tracker.sweep().await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, PresenceStatus::Away);
        assert_eq!(tracker.status_of("u1"), Some(PresenceStatus::Away));

        tokio::time::advance(Duration::from_secs(300)).await;
        let changes = tracker.sweep().await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, PresenceStatus::Offline);
        assert_eq!(tracker.status_of("u1"), None);
        assert_eq!(tracker.user_of("s1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_promotes_away_user() {
        let (tracker, changes) = tracker();
        tracker.track("s1", "u1", PresenceStatus::Online).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        tracker.sweep().await.unwrap();
        assert_eq!(tracker.status_of("u1"), Some(PresenceStatus::Away));

        tracker.heartbeat("s1").await.unwrap();
        assert_eq!(tracker.status_of("u1"), Some(PresenceStatus::Online));
        assert_eq!(changes.lock().last().unwrap().status, PresenceStatus::Online);

        // Fresh activity; nothing to sweep.
        assert!(tracker.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_status_notifies_on_change_only() {
        let (tracker, changes) = tracker();
        tracker.track("s1", "u1", PresenceStatus::Online).await.unwrap();

        tracker.set_status("s1", PresenceStatus::Busy).await.unwrap();
        tracker.set_status("s1", PresenceStatus::Busy).await.unwrap();

        let seen = changes.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].status, PresenceStatus::Busy);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_session_is_noop() {
        let (tracker, changes) = tracker();
        tracker.heartbeat("ghost").await.unwrap();
        assert!(changes.lock().is_empty());
    }
}
