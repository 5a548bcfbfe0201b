//! Time-Series Sink Abstraction
//!
//! The writer talks to the store through a two-part contract:
//!
//! 1. `write_record` buffers one line, `flush` hands everything buffered to
//!    the store. Neither call returns a result or waits on the network.
//! 2. Failures surface later on an error channel the sink was built with
//!    (`ErrorSender`). The `ErrorReporter` drains the other end.
//!
//! Implementations:
//! - `MemorySink`: For unit tests and fault-injection tests
//! - `InfluxSink`: InfluxDB v2 HTTP write API (feature `influx`)

pub mod memory;
#[cfg(feature = "influx")]
pub mod influx;

pub use memory::{FaultConfig, FlushedBatches, MemorySink};
#[cfg(feature = "influx")]
pub use influx::InfluxSink;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::error;

/// Destination for formatted line-protocol points
pub trait Sink: Send + 'static {
    /// Buffer one line
    fn write_record(&mut self, line: String);

    /// Send everything buffered now. Outcome is reported on the error channel.
    fn flush(&mut self);

    /// Flush and wait for every in-flight write to finish
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Why a flush failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Request never got a response
    Transport(String),
    /// Store answered with a non-success status
    Rejected { status: u16, body: String },
    /// Fault injected by a test sink
    Injected,
}

/// One failed flush. The lines it carried are lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    pub lines: usize,
    pub kind: WriteErrorKind,
}

impl WriteError {
    pub fn transport(lines: usize, msg: impl Into<String>) -> Self {
        WriteError {
            lines,
            kind: WriteErrorKind::Transport(msg.into()),
        }
    }

    pub fn rejected(lines: usize, status: u16, body: impl Into<String>) -> Self {
        WriteError {
            lines,
            kind: WriteErrorKind::Rejected {
                status,
                body: body.into(),
            },
        }
    }

    pub fn injected(lines: usize) -> Self {
        WriteError {
            lines,
            kind: WriteErrorKind::Injected,
        }
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WriteErrorKind::Transport(msg) => {
                write!(f, "{} lines not written: transport error: {}", self.lines, msg)
            }
            WriteErrorKind::Rejected { status, body } => write!(
                f,
                "{} lines not written: store returned {}: {}",
                self.lines, status, body
            ),
            WriteErrorKind::Injected => {
                write!(f, "{} lines not written: injected fault", self.lines)
            }
        }
    }
}

impl std::error::Error for WriteError {}

/// Handle a sink uses to report failed flushes. Never blocks.
///
/// A report that cannot be queued is logged here and counted, so the
/// reporter's totals still include it.
#[derive(Debug, Clone)]
pub struct ErrorSender {
    tx: mpsc::Sender<WriteError>,
    unqueued: Arc<AtomicU64>,
}

impl ErrorSender {
    pub fn report(&self, err: WriteError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                self.unqueued.fetch_add(1, Ordering::Relaxed);
                error!("write error: {} (error queue full)", err);
            }
            Err(TrySendError::Closed(err)) => {
                self.unqueued.fetch_add(1, Ordering::Relaxed);
                error!("write error: {} (error reporter gone)", err);
            }
        }
    }
}

/// Reporter side of the error channel
#[derive(Debug)]
pub struct ErrorReceiver {
    rx: mpsc::Receiver<WriteError>,
    unqueued: Arc<AtomicU64>,
}

impl ErrorReceiver {
    pub async fn recv(&mut self) -> Option<WriteError> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<WriteError, TryRecvError> {
        self.rx.try_recv()
    }

    /// Reports logged by a sender because they could not be queued
    pub fn unqueued(&self) -> u64 {
        self.unqueued.load(Ordering::Relaxed)
    }
}

/// Create the error channel shared by a sink and its reporter
pub fn error_channel(capacity: usize) -> (ErrorSender, ErrorReceiver) {
    debug_assert!(capacity > 0, "error queue capacity must be positive");
    let (tx, rx) = mpsc::channel(capacity);
    let unqueued = Arc::new(AtomicU64::new(0));
    (
        ErrorSender {
            tx,
            unqueued: Arc::clone(&unqueued),
        },
        ErrorReceiver { rx, unqueued },
    )
}
