//! Test utilities shared by unit tests and downstream crates.
//!
//! Helpers here panic on timeout instead of returning errors so a stuck
//! relay fails the test quickly with a readable message.

use std::time::Duration;

use tokio::sync::watch;

use crate::bus::Record;
use crate::hub::ConnectionReceiver;
use crate::services::ConsumerState;

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a record as a broker would hand it to the consumer.
pub fn make_record(topic: &str, offset: i64, payload: &str) -> Record {
    Record {
        topic: topic.to_string(),
        partition: 0,
        offset,
        payload: Some(payload.as_bytes().to_vec()),
    }
}

/// Wait until the consumer reports `target`.
pub async fn wait_for_state(state: &mut watch::Receiver<ConsumerState>, target: ConsumerState) {
    let reached = tokio::time::timeout(TEST_TIMEOUT, state.wait_for(|s| *s == target))
        .await
        .map(|r| r.map(|_| ()));
    match reached {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => panic!("consumer dropped before reaching {}", target),
        Err(_) => panic!(
            "consumer did not reach {} within {:?} (currently {})",
            target,
            TEST_TIMEOUT,
            *state.borrow()
        ),
    }
}

/// Receive the next broadcast payload on a hub connection.
pub async fn recv_text(receiver: &mut ConnectionReceiver) -> String {
    match tokio::time::timeout(TEST_TIMEOUT, receiver.recv()).await {
        Ok(Some(payload)) => payload.to_string(),
        Ok(None) => panic!("connection {} closed while waiting", receiver.id()),
        Err(_) => panic!("no payload on {} within {:?}", receiver.id(), TEST_TIMEOUT),
    }
}
