//! In-memory sink with deterministic fault injection
//!
//! Each successful flush is kept as one batch of lines. Failed flushes are
//! reported on the error channel exactly like a real store rejection would be.

use super::{ErrorSender, Sink, WriteError};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

/// Which flushes fail
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// The first `fail_first` flushes fail
    pub fail_first: u64,
    /// Probability that any later flush fails
    pub fail_prob: f64,
    /// Seed for `fail_prob`; the same seed fails the same flushes
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::no_faults()
    }
}

impl FaultConfig {
    pub fn no_faults() -> Self {
        FaultConfig {
            fail_first: 0,
            fail_prob: 0.0,
            seed: 0,
        }
    }

    pub fn fail_first(n: u64) -> Self {
        FaultConfig {
            fail_first: n,
            ..Self::no_faults()
        }
    }

    pub fn random(fail_prob: f64, seed: u64) -> Self {
        FaultConfig {
            fail_first: 0,
            fail_prob: fail_prob.clamp(0.0, 1.0),
            seed,
        }
    }
}

#[derive(Debug, Default)]
struct Flushed {
    batches: Vec<Vec<String>>,
    failed: u64,
}

/// Read side of a `MemorySink`, cloneable and usable after the sink is gone
#[derive(Debug, Clone)]
pub struct FlushedBatches {
    inner: Arc<Mutex<Flushed>>,
    count_rx: watch::Receiver<usize>,
}

impl FlushedBatches {
    /// Successfully flushed batches, in flush order
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.inner.lock().batches.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_lines(&self) -> usize {
        self.inner.lock().batches.iter().map(Vec::len).sum()
    }

    pub fn failed_flushes(&self) -> u64 {
        self.inner.lock().failed
    }

    /// Wait until at least `count` batches have been flushed successfully.
    /// Returns early if the sink is dropped first.
    pub async fn wait_for(&self, count: usize) {
        let mut rx = self.count_rx.clone();
        let _ = rx.wait_for(|flushed| *flushed >= count).await;
    }
}

/// Sink that keeps flushed lines in memory
pub struct MemorySink {
    buffer: Vec<String>,
    flushed: Arc<Mutex<Flushed>>,
    count_tx: watch::Sender<usize>,
    errors: ErrorSender,
    faults: FaultConfig,
    rng: ChaCha8Rng,
    flush_attempts: u64,
}

impl MemorySink {
    pub fn new(errors: ErrorSender) -> (Self, FlushedBatches) {
        Self::with_faults(errors, FaultConfig::no_faults())
    }

    pub fn with_faults(errors: ErrorSender, faults: FaultConfig) -> (Self, FlushedBatches) {
        let flushed = Arc::new(Mutex::new(Flushed::default()));
        let (count_tx, count_rx) = watch::channel(0);
        let sink = MemorySink {
            buffer: Vec::new(),
            flushed: Arc::clone(&flushed),
            count_tx,
            errors,
            rng: ChaCha8Rng::seed_from_u64(faults.seed),
            faults,
            flush_attempts: 0,
        };
        let handle = FlushedBatches {
            inner: flushed,
            count_rx,
        };
        (sink, handle)
    }

    /// Lines written since the last flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn should_fail(&mut self) -> bool {
        if self.flush_attempts <= self.faults.fail_first {
            return true;
        }
        self.faults.fail_prob > 0.0 && self.rng.gen_bool(self.faults.fail_prob)
    }
}

impl Sink for MemorySink {
    fn write_record(&mut self, line: String) {
        self.buffer.push(line);
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.buffer);
        self.flush_attempts += 1;

        if self.should_fail() {
            self.flushed.lock().failed += 1;
            self.errors.report(WriteError::injected(lines.len()));
            return;
        }

        let count = {
            let mut flushed = self.flushed.lock();
            flushed.batches.push(lines);
            flushed.batches.len()
        };
        self.count_tx.send_replace(count);
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.flush();
        })
    }
}
