//! Pipeline
//!
//! Wires one measurement kind end to end:
//!
//! ```text
//! readers ──► record queue ──► WindowAggregator ──► batch queue ──► BatchWriter ──► Sink
//!                                                                                  │
//!                                                        ErrorReporter ◄── errors ─┘
//! ```
//!
//! Readers share one bounded record queue. The aggregator is the only consumer
//! of that queue and the writer is the only consumer of batches, so windows
//! are written in the order they closed.
//!
//! Shutdown runs front to back: readers are cancelled and joined, the last
//! record sender is dropped, the aggregator emits the partial window, the
//! writer drains and closes the sink, and the reporter exits once the sink's
//! error senders are gone.

use crate::aggregator::{spawn_aggregator, AggregatorStats};
use crate::clock::WriteClock;
use crate::config::PipelineConfig;
use crate::decode::RecordDecoder;
use crate::frame::{Frame, FrameError};
use crate::queue::{record_queue, RecordSender};
use crate::reader::{ConnectionReader, ReaderStats};
use crate::reporter::{spawn_reporter, ReporterStats};
use crate::sink::{ErrorReceiver, Sink};
use crate::writer::{spawn_writer, WriterStats};
use futures::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Totals reported once the pipeline has drained
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub readers: ReaderStats,
    pub aggregator: AggregatorStats,
    pub writer: WriterStats,
    /// Every failed flush, including those the sink logged without queueing
    pub write_errors: u64,
    pub reporter: ReporterStats,
}

struct ReaderSet {
    tasks: JoinSet<ReaderStats>,
    totals: ReaderStats,
}

impl ReaderSet {
    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            match result {
                Ok(stats) => self.totals.merge(&stats),
                Err(e) => error!("Reader task failed: {}", e),
            }
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Start the aggregator, writer and reporter tasks.
    ///
    /// `sink` must report into the sender paired with `error_rx`.
    pub fn spawn<D, C, S>(
        config: &PipelineConfig,
        decoder: D,
        clock: C,
        sink: S,
        error_rx: ErrorReceiver,
    ) -> PipelineHandle<D>
    where
        D: RecordDecoder,
        C: WriteClock,
        S: Sink,
    {
        let (records, record_rx) = record_queue(config.record_queue_capacity, config.overflow);
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_queue_capacity);

        let aggregator = spawn_aggregator(config.window, config.max_records, record_rx, batch_tx);
        let writer = spawn_writer(batch_rx, sink, clock);
        let reporter = spawn_reporter(error_rx);

        info!(
            "Pipeline started (window {:?}, max {} records, overflow {:?})",
            config.window, config.max_records, config.overflow
        );

        PipelineHandle {
            decoder: Arc::new(decoder),
            records,
            observe_tag: config.observe_tag,
            cancel: CancellationToken::new(),
            readers: Mutex::new(ReaderSet {
                tasks: JoinSet::new(),
                totals: ReaderStats::default(),
            }),
            aggregator,
            writer,
            reporter,
        }
    }
}

pub struct PipelineHandle<D: RecordDecoder> {
    decoder: Arc<D>,
    records: RecordSender<D::Record>,
    observe_tag: u8,
    cancel: CancellationToken,
    readers: Mutex<ReaderSet>,
    aggregator: JoinHandle<AggregatorStats>,
    writer: JoinHandle<WriterStats>,
    reporter: JoinHandle<ReporterStats>,
}

impl<D: RecordDecoder> PipelineHandle<D> {
    /// Start a reader for one connection's frame stream
    pub fn spawn_reader<S>(&self, frames: S, peer: impl Into<String>)
    where
        S: Stream<Item = Result<Frame, FrameError>> + Unpin + Send + 'static,
    {
        let reader = ConnectionReader::new(
            self.decoder.clone(),
            self.records.clone(),
            self.observe_tag,
            peer.into(),
            self.cancel.child_token(),
        );

        let mut readers = self.readers.lock();
        readers.reap_finished();
        readers.tasks.spawn(reader.run(frames));
    }

    /// Sender for injecting records without a connection.
    ///
    /// Every clone must be dropped before `shutdown` can finish: the
    /// aggregator only emits its last window once all senders are gone.
    pub fn record_sender(&self) -> RecordSender<D::Record> {
        self.records.clone()
    }

    /// Readers still running
    pub fn active_readers(&self) -> usize {
        let mut readers = self.readers.lock();
        readers.reap_finished();
        readers.tasks.len()
    }

    /// Stop accepting frames and drain everything already received.
    ///
    /// Waits for the fan-in to close, so senders from `record_sender` must
    /// be dropped first or this never returns.
    pub async fn shutdown(self) -> PipelineStats {
        let PipelineHandle {
            records,
            cancel,
            readers,
            aggregator,
            writer,
            reporter,
            ..
        } = self;

        cancel.cancel();
        let ReaderSet { mut tasks, mut totals } = readers.into_inner();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(stats) => totals.merge(&stats),
                Err(e) => error!("Reader task failed: {}", e),
            }
        }

        // Last sender; the aggregator sees the queue close and flushes
        drop(records);

        let aggregator = aggregator.await.unwrap_or_else(|e| {
            error!("Aggregator task failed: {}", e);
            AggregatorStats::default()
        });
        let writer = writer.await.unwrap_or_else(|e| {
            error!("Writer task failed: {}", e);
            WriterStats::default()
        });
        let reporter = reporter.await.unwrap_or_else(|e| {
            error!("Error reporter task failed: {}", e);
            ReporterStats::default()
        });

        let stats = PipelineStats {
            readers: totals,
            aggregator,
            writer,
            write_errors: reporter.total(),
            reporter,
        };
        info!(
            "Pipeline drained: {} connections, {} records written in {} batches, {} write errors",
            stats.readers.connections, stats.writer.records, stats.writer.batches, stats.write_errors
        );
        stats
    }
}
