//! Progress event schema and channel
//!
//! The execution engine (and the scanner and diff engine for their own
//! phases) is the sole producer of progress events; collaborators consume
//! them from the receiving half. The channel is bounded and the sender
//! never waits for the consumer: when the consumer falls behind, events
//! are dropped. Backpressure affects progress visibility only, never the
//! operations themselves.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::newtypes::LibraryPath;

/// Which phase of the run emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    /// Walking the roots
    Scanning,
    /// Computing the change set
    Diffing,
    /// Applying operations
    Executing,
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressPhase::Scanning => write!(f, "scanning"),
            ProgressPhase::Diffing => write!(f, "diffing"),
            ProgressPhase::Executing => write!(f, "executing"),
        }
    }
}

/// One progress event, emitted per entry/operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Emitting phase
    pub phase: ProgressPhase,
    /// The path being worked on, when one applies
    pub path: Option<LibraryPath>,
    /// Bytes completed so far in this phase
    pub bytes_done: u64,
    /// Total bytes this phase will process (0 when unknown)
    pub bytes_total: u64,
    /// Operations (or entries) completed so far
    pub operations_done: u64,
    /// Total operations (or entries) in this phase (0 when unknown)
    pub operations_total: u64,
}

/// Sending half of a progress channel
///
/// `emit` uses `try_send`: a full buffer means the consumer is lagging and
/// the event is dropped rather than blocking the producer.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Emits an event; returns false if it was dropped
    pub fn emit(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            // A closed receiver means nobody is watching; dropping is fine.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Creates a bounded, order-preserving progress channel
pub fn progress_channel(capacity: usize) -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(done: u64) -> ProgressEvent {
        ProgressEvent {
            phase: ProgressPhase::Executing,
            path: None,
            bytes_done: 0,
            bytes_total: 0,
            operations_done: done,
            operations_total: 10,
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut rx) = progress_channel(8);
        for i in 0..3 {
            assert!(tx.emit(event(i)));
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().operations_done, i);
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = progress_channel(1);
        assert!(tx.emit(event(0)));
        // Consumer hasn't drained; the second emit must not block.
        assert!(!tx.emit(event(1)));
        assert_eq!(rx.recv().await.unwrap().operations_done, 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_does_not_error() {
        let (tx, rx) = progress_channel(4);
        drop(rx);
        assert!(!tx.emit(event(0)));
    }
}
