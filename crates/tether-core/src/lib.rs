//! # tether-core
//!
//! Domain layer for the tether session system: the wire envelope, session
//! records, room names, presence types, and the reserved event vocabulary.
//! This crate has zero dependencies on infrastructure (Redis, runtime, etc.).

pub mod envelope;
pub mod events;
pub mod presence;
pub mod session;

// Re-export commonly used types at crate root
pub use envelope::Envelope;
pub use presence::{PresenceChange, PresenceRecord, PresenceStatus};
pub use session::{SessionRecord, DEFAULT_NAMESPACE};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All timestamps in the system (session activity, envelope timestamps,
/// watermarks) use this representation.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
