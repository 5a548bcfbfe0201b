//! Bounded fan-in queue
//!
//! Every connection reader publishes into one bounded channel that the window
//! aggregator drains. What happens when that channel is full is decided by
//! the `OverflowPolicy`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Behaviour of the fan-in queue when it is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    /// Suspend the producing reader until there is room. Backpressure reaches
    /// the connection because the reader stops pulling frames.
    Block,
    /// Discard the incoming record and keep reading.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop_newest" | "drop-newest" | "drop" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!("unknown overflow policy '{}'", other)),
        }
    }
}

/// Result of publishing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full under `DropNewest`
    Dropped,
    /// Aggregator is gone
    Closed,
}

/// Producer side of the fan-in queue
pub struct RecordSender<R> {
    tx: mpsc::Sender<R>,
    policy: OverflowPolicy,
}

impl<R> Clone for RecordSender<R> {
    fn clone(&self) -> Self {
        RecordSender {
            tx: self.tx.clone(),
            policy: self.policy,
        }
    }
}

impl<R: Send> RecordSender<R> {
    pub async fn send(&self, record: R) -> SendOutcome {
        match self.policy {
            OverflowPolicy::Block => match self.tx.send(record).await {
                Ok(()) => SendOutcome::Queued,
                Err(_) => SendOutcome::Closed,
            },
            OverflowPolicy::DropNewest => match self.tx.try_send(record) {
                Ok(()) => SendOutcome::Queued,
                Err(TrySendError::Full(_)) => SendOutcome::Dropped,
                Err(TrySendError::Closed(_)) => SendOutcome::Closed,
            },
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

/// Create the fan-in queue
pub fn record_queue<R>(capacity: usize, policy: OverflowPolicy) -> (RecordSender<R>, mpsc::Receiver<R>) {
    debug_assert!(capacity > 0, "record queue capacity must be positive");
    let (tx, rx) = mpsc::channel(capacity);
    (RecordSender { tx, policy }, rx)
}
