//! Batch Writer
//!
//! Renders each record of a batch as a line-protocol point, hands the lines
//! to the sink and flushes once per batch so the whole batch leaves together.
//! The flush outcome is not awaited here; see `reporter`.

use crate::aggregator::Batch;
use crate::clock::WriteClock;
use crate::decode::Measurement;
use crate::line::format_line;
use crate::sink::Sink;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches: u64,
    pub records: u64,
}

pub struct BatchWriter<R, S, C> {
    rx: mpsc::Receiver<Batch<R>>,
    sink: S,
    clock: C,
    stats: WriterStats,
}

impl<R, S, C> BatchWriter<R, S, C>
where
    R: Measurement,
    S: Sink,
    C: WriteClock,
{
    pub fn new(rx: mpsc::Receiver<Batch<R>>, sink: S, clock: C) -> Self {
        BatchWriter {
            rx,
            sink,
            clock,
            stats: WriterStats::default(),
        }
    }

    /// Write batches until the batch queue closes, then close the sink
    pub async fn run(mut self) -> WriterStats {
        while let Some(batch) = self.rx.recv().await {
            self.write_batch(batch);
        }

        self.sink.close().await;
        info!(
            "Batch writer shutting down ({} records in {} batches)",
            self.stats.records, self.stats.batches
        );
        self.stats
    }

    fn write_batch(&mut self, batch: Batch<R>) {
        debug_assert!(!batch.is_empty(), "empty batches never reach the writer");
        let count = batch.len();

        for record in batch.into_records() {
            // Timestamped at format time, not capture time
            let line = format_line(&record, self.clock.now_nanos());
            self.sink.write_record(line);
        }
        self.sink.flush();

        self.stats.batches += 1;
        self.stats.records += count as u64;
        info!("Insert {} {} values", count, R::NAME);
    }
}

pub fn spawn_writer<R, S, C>(
    rx: mpsc::Receiver<Batch<R>>,
    sink: S,
    clock: C,
) -> tokio::task::JoinHandle<WriterStats>
where
    R: Measurement,
    S: Sink,
    C: WriteClock,
{
    tokio::spawn(BatchWriter::new(rx, sink, clock).run())
}
