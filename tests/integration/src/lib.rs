//! Integration test utilities for the tether session layer.
//!
//! Provides an in-process transport bridging the client runtime to the
//! engine, plus shared fixtures for end-to-end scenarios.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
