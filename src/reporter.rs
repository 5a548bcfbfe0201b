//! Error Reporter
//!
//! Drains the sink's error channel for the life of the pipeline and logs each
//! failed flush. Nothing is retried; the lines in a failed flush are lost.

use crate::sink::ErrorReceiver;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    /// Errors received and logged here
    pub reported: u64,
    /// Errors the sink logged itself because the queue was full
    pub unqueued: u64,
}

impl ReporterStats {
    /// Every failed flush, queued or not
    pub fn total(&self) -> u64 {
        self.reported + self.unqueued
    }
}

pub struct ErrorReporter {
    rx: ErrorReceiver,
}

impl ErrorReporter {
    pub fn new(rx: ErrorReceiver) -> Self {
        ErrorReporter { rx }
    }

    /// Runs until every sender is gone
    pub async fn run(mut self) -> ReporterStats {
        let mut reported = 0u64;
        while let Some(err) = self.rx.recv().await {
            reported += 1;
            error!("write error: {}", err);
        }

        let stats = ReporterStats {
            reported,
            unqueued: self.rx.unqueued(),
        };
        info!(
            "Error reporter shutting down ({} write errors, {} logged by the sink)",
            stats.total(),
            stats.unqueued
        );
        stats
    }
}

pub fn spawn_reporter(rx: ErrorReceiver) -> tokio::task::JoinHandle<ReporterStats> {
    tokio::spawn(ErrorReporter::new(rx).run())
}
