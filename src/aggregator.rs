//! Window Aggregator - Time-or-Count Batching
//!
//! The aggregator owns the single open window. Records from every connection
//! arrive on the fan-in queue; the window closes when it holds `max_records`
//! records or when `window` has elapsed since it opened, whichever is first.
//!
//! ```text
//! Reader 1 ──┐
//! Reader 2 ──┤──► fan-in ──► WindowAggregator ──► Batch ──► BatchWriter
//! Reader 3 ──┘                 (count | timer)
//! ```
//!
//! A closed window becomes an immutable `Batch` and a fresh window opens at
//! the same instant, restarting the timer. Empty windows are discarded when
//! their timer fires. When every producer has gone the last non-empty window
//! is emitted and the aggregator exits, closing the batch queue.

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info};

/// Upper bound on the up-front allocation for a window's record buffer
const WINDOW_PREALLOC_MAX: usize = 1024;

/// Which condition closed a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Count,
    Time,
    /// Fan-in closed; final partial window
    Shutdown,
}

/// The in-progress accumulation of records between flushes
#[derive(Debug)]
pub struct Window<R> {
    records: Vec<R>,
    opened_at: Instant,
}

impl<R> Window<R> {
    fn open(opened_at: Instant, max_records: usize) -> Self {
        Window {
            records: Vec::with_capacity(max_records.min(WINDOW_PREALLOC_MAX)),
            opened_at,
        }
    }

    fn push(&mut self, record: R) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    fn close(self, trigger: FlushTrigger, closed_at: Instant) -> Batch<R> {
        Batch {
            records: self.records,
            closed_at,
            trigger,
        }
    }
}

/// A closed window, handed to the writer exactly once
#[derive(Debug)]
pub struct Batch<R> {
    records: Vec<R>,
    closed_at: Instant,
    trigger: FlushTrigger,
}

impl<R> Batch<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }

    pub fn closed_at(&self) -> Instant {
        self.closed_at
    }

    pub fn trigger(&self) -> FlushTrigger {
        self.trigger
    }
}

/// Counters reported when the aggregator exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub records: u64,
    pub batches: u64,
    pub count_flushes: u64,
    pub time_flushes: u64,
    pub shutdown_flushes: u64,
    /// Timer expiries on an empty window
    pub empty_ticks: u64,
}

/// Owns the open window and races the count trigger against the timer
pub struct WindowAggregator<R> {
    window_len: Duration,
    max_records: usize,
    rx: mpsc::Receiver<R>,
    tx: mpsc::Sender<Batch<R>>,
    window: Window<R>,
    stats: AggregatorStats,
}

impl<R: Send + 'static> WindowAggregator<R> {
    pub fn new(
        window_len: Duration,
        max_records: usize,
        rx: mpsc::Receiver<R>,
        tx: mpsc::Sender<Batch<R>>,
    ) -> Self {
        debug_assert!(max_records > 0, "max_records must be positive");
        debug_assert!(!window_len.is_zero(), "window must be non-zero");
        WindowAggregator {
            window_len,
            max_records,
            rx,
            tx,
            window: Window::open(Instant::now(), max_records),
            stats: AggregatorStats::default(),
        }
    }

    /// Run until the fan-in closes or the writer goes away
    pub async fn run(mut self) -> AggregatorStats {
        // The first window opens when the loop starts, not at construction
        self.window = Window::open(Instant::now(), self.max_records);

        loop {
            let deadline = self.window.opened_at + self.window_len;

            tokio::select! {
                // Timer first: under a backlog the window still closes on time
                biased;

                _ = sleep_until(deadline) => {
                    if !self.close_window(FlushTrigger::Time).await {
                        break;
                    }
                }
                next = self.rx.recv() => match next {
                    Some(record) => {
                        self.window.push(record);
                        self.stats.records += 1;
                        if self.window.len() >= self.max_records
                            && !self.close_window(FlushTrigger::Count).await
                        {
                            break;
                        }
                    }
                    None => {
                        self.close_window(FlushTrigger::Shutdown).await;
                        info!(
                            "Window aggregator shutting down ({} records in {} batches)",
                            self.stats.records, self.stats.batches
                        );
                        break;
                    }
                },
            }
        }

        self.stats
    }

    /// Close the open window and emit it. Returns false if the writer is gone.
    async fn close_window(&mut self, trigger: FlushTrigger) -> bool {
        let now = Instant::now();
        let window = std::mem::replace(&mut self.window, Window::open(now, self.max_records));

        if window.is_empty() {
            if trigger == FlushTrigger::Time {
                self.stats.empty_ticks += 1;
            }
            return true;
        }

        let batch = window.close(trigger, now);
        let len = batch.len();
        debug!("Window closed by {:?} with {} records", trigger, len);

        match trigger {
            FlushTrigger::Count => self.stats.count_flushes += 1,
            FlushTrigger::Time => self.stats.time_flushes += 1,
            FlushTrigger::Shutdown => self.stats.shutdown_flushes += 1,
        }
        self.stats.batches += 1;

        if self.tx.send(batch).await.is_err() {
            error!("Batch writer unavailable, {} records lost", len);
            return false;
        }
        true
    }
}

/// Spawn an aggregator task
pub fn spawn_aggregator<R: Send + 'static>(
    window_len: Duration,
    max_records: usize,
    rx: mpsc::Receiver<R>,
    tx: mpsc::Sender<Batch<R>>,
) -> tokio::task::JoinHandle<AggregatorStats> {
    let aggregator = WindowAggregator::new(window_len, max_records, rx, tx);
    tokio::spawn(aggregator.run())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(
        max_records: usize,
        window: Duration,
    ) -> (
        mpsc::Sender<u32>,
        mpsc::Receiver<Batch<u32>>,
        tokio::task::JoinHandle<AggregatorStats>,
    ) {
        let (record_tx, record_rx) = mpsc::channel(1024);
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let task = spawn_aggregator(window, max_records, record_rx, batch_tx);
        (record_tx, batch_rx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_trigger_before_timer() {
        let (tx, mut batches, task) = channels(3, Duration::from_secs(30));
        let start = Instant::now();

        for i in 0..3 {
            tx.send(i).await.unwrap();
        }

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.records(), &[0, 1, 2]);
        assert_eq!(batch.trigger(), FlushTrigger::Count);
        assert!(start.elapsed() < Duration::from_secs(30));

        drop(tx);
        let stats = task.await.unwrap();
        assert_eq!(stats.count_flushes, 1);
        assert_eq!(stats.batches, 1);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_with_partial_window() {
        let (tx, mut batches, task) = channels(1000, Duration::from_secs(30));
        let start = Instant::now();

        tx.send(7).await.unwrap();
        tx.send(8).await.unwrap();

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.records(), &[7, 8]);
        assert_eq!(batch.trigger(), FlushTrigger::Time);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));

        drop(tx);
        let stats = task.await.unwrap();
        assert_eq!(stats.time_flushes, 1);
        assert_eq!(stats.shutdown_flushes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_emits_nothing() {
        let (tx, mut batches, task) = channels(10, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(batches.try_recv().is_err(), "no batch for empty windows");

        tx.send(1).await.unwrap();
        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.trigger(), FlushTrigger::Time);

        drop(tx);
        let stats = task.await.unwrap();
        assert!(stats.empty_ticks >= 3);
        assert_eq!(stats.batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_after_count_flush() {
        let (tx, mut batches, task) = channels(2, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(20)).await;
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        let first = batches.recv().await.unwrap();
        assert_eq!(first.trigger(), FlushTrigger::Count);
        let count_closed_at = first.closed_at();

        // The next window's timer runs a full 30s from the count flush,
        // not from when the previous window opened
        tx.send(3).await.unwrap();
        let second = batches.recv().await.unwrap();
        assert_eq!(second.records(), &[3]);
        assert_eq!(second.trigger(), FlushTrigger::Time);
        assert!(second.closed_at() - count_closed_at >= Duration::from_secs(30));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_partial_window() {
        let (tx, mut batches, task) = channels(100, Duration::from_secs(30));

        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.records(), &[0, 1, 2, 3, 4]);
        assert_eq!(batch.trigger(), FlushTrigger::Shutdown);
        assert!(batches.recv().await.is_none());

        let stats = task.await.unwrap();
        assert_eq!(stats.shutdown_flushes, 1);
        assert_eq!(stats.records, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_loss_no_duplication() {
        let (tx, mut batches, task) = channels(1000, Duration::from_secs(30));

        let producer = tokio::spawn(async move {
            for i in 0..2500u32 {
                tx.send(i).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        let mut sizes = Vec::new();
        while let Some(batch) = batches.recv().await {
            assert!(!batch.is_empty());
            sizes.push(batch.len());
            seen.extend(batch.into_records());
        }
        producer.await.unwrap();

        assert_eq!(seen, (0..2500).collect::<Vec<_>>());
        assert_eq!(sizes, vec![1000, 1000, 500]);
        let stats = task.await.unwrap();
        assert_eq!(stats.records, 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_gone_stops_aggregator() {
        let (tx, batches, task) = channels(1, Duration::from_secs(30));
        drop(batches);

        tx.send(1).await.unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.batches, 1);
    }
}
