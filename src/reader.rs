//! Connection Reader
//!
//! One reader per accepted connection. Frames are decoded in arrival order;
//! each good record goes onto the shared fan-in queue, each bad frame is
//! logged and skipped. The reader ends when its connection ends, fails, or
//! the pipeline is cancelled, without touching any other connection.

use crate::decode::RecordDecoder;
use crate::frame::{Frame, FrameError};
use crate::queue::{RecordSender, SendOutcome};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Per-connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub connections: u64,
    pub frames: u64,
    pub decoded: u64,
    pub decode_errors: u64,
    /// Frames with a tag other than the observed one
    pub skipped: u64,
    /// Records discarded by the overflow policy
    pub dropped: u64,
}

impl ReaderStats {
    pub fn merge(&mut self, other: &ReaderStats) {
        self.connections += other.connections;
        self.frames += other.frames;
        self.decoded += other.decoded;
        self.decode_errors += other.decode_errors;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
    }
}

pub struct ConnectionReader<D: RecordDecoder> {
    decoder: Arc<D>,
    records: RecordSender<D::Record>,
    observe_tag: u8,
    peer: String,
    cancel: CancellationToken,
    stats: ReaderStats,
}

impl<D: RecordDecoder> ConnectionReader<D> {
    pub fn new(
        decoder: Arc<D>,
        records: RecordSender<D::Record>,
        observe_tag: u8,
        peer: String,
        cancel: CancellationToken,
    ) -> Self {
        ConnectionReader {
            decoder,
            records,
            observe_tag,
            peer,
            cancel,
            stats: ReaderStats {
                connections: 1,
                ..ReaderStats::default()
            },
        }
    }

    pub async fn run<S>(mut self, mut frames: S) -> ReaderStats
    where
        S: Stream<Item = Result<Frame, FrameError>> + Unpin,
    {
        debug!("Client connected: {}", self.peer);

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Closing connection {} for shutdown", self.peer);
                    break;
                }
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    if !self.handle_frame(frame).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("Connection error from {}: {}", self.peer, e);
                    break;
                }
                None => {
                    debug!("Client disconnected: {}", self.peer);
                    break;
                }
            }
        }

        self.stats
    }

    /// Returns false once the aggregator is gone
    async fn handle_frame(&mut self, frame: Frame) -> bool {
        self.stats.frames += 1;
        if frame.tag != self.observe_tag {
            self.stats.skipped += 1;
            return true;
        }

        let record = match self.decoder.decode(&frame.payload) {
            Ok(record) => record,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!("Dropping undecodable frame from {}: {}", self.peer, e);
                return true;
            }
        };
        self.stats.decoded += 1;

        match self.records.send(record).await {
            SendOutcome::Queued => true,
            SendOutcome::Dropped => {
                self.stats.dropped += 1;
                warn!("Record queue full, dropping record from {}", self.peer);
                true
            }
            SendOutcome::Closed => {
                warn!("Aggregator gone, closing connection {}", self.peer);
                false
            }
        }
    }
}
