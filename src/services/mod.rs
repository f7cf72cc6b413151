//! Long-running relay services.

pub mod consumer;

pub use consumer::{ConsumerState, EventConsumer};
