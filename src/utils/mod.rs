//! Shared utilities.
//!
//! Process bootstrap, retry policies and shutdown signalling used across the
//! relay components.

pub mod bootstrap;
pub mod retry;
pub mod shutdown;
