//! Shutdown signalling shared by the relay's background tasks.

use tokio::sync::watch;

/// Create a shutdown channel. Send `true` to request shutdown.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown was requested or the sender was dropped.
///
/// Cancel-safe, so it can sit in a `select!` arm of a loop.
pub async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
