//! Batching Sink
//!
//! Buffers events on the producer side and hands full buffers to a single
//! background task that submits them to the [`AnalyticsSink`]. The buffer is
//! moved on hand-off so a batch in flight is never touched again by the
//! producer. [`BatchingSink::drain`] consumes the sink, which makes the final
//! flush impossible to skip or repeat.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::analytics::AnalyticsSink;
use crate::sync::event::OutputEvent;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 2_000;

/// Totals reported by the submission task once the sink is drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub events_submitted: usize,
    pub batches_submitted: usize,
    pub failed_batches: usize,
    pub events_failed: usize,
    /// Hand-offs triggered by the threshold rather than by `drain`.
    pub auto_flushes: usize,
}

pub struct BatchingSink {
    buffer: Vec<OutputEvent>,
    threshold: usize,
    tx: mpsc::UnboundedSender<Vec<OutputEvent>>,
    worker: JoinHandle<SinkReport>,
    auto_flushes: usize,
}

impl BatchingSink {
    /// Spawn the submission task. Must be called inside a Tokio runtime.
    pub fn spawn(analytics: Arc<dyn AnalyticsSink>, threshold: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(submit_loop(rx, analytics));
        Self {
            buffer: Vec::new(),
            threshold,
            tx,
            worker,
            auto_flushes: 0,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer one event, handing the buffer off once it holds more than the threshold.
    pub fn push(&mut self, event: OutputEvent) {
        self.buffer.push(event);
        if self.buffer.len() > self.threshold {
            self.auto_flushes += 1;
            self.hand_off();
        }
    }

    /// Flush whatever is buffered and wait for every submission to finish.
    pub async fn drain(mut self) -> SinkReport {
        self.hand_off();
        let Self {
            tx,
            worker,
            auto_flushes,
            ..
        } = self;
        drop(tx);

        let mut report = match worker.await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "analytics submission task failed");
                SinkReport::default()
            }
        };
        report.auto_flushes = auto_flushes;
        report
    }

    fn hand_off(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let size = batch.len();
        if self.tx.send(batch).is_err() {
            error!(events = size, "analytics submission task is gone, dropping batch");
        } else {
            debug!(events = size, "handed off analytics batch");
        }
    }
}

async fn submit_loop(
    mut rx: mpsc::UnboundedReceiver<Vec<OutputEvent>>,
    analytics: Arc<dyn AnalyticsSink>,
) -> SinkReport {
    let mut report = SinkReport::default();

    while let Some(batch) = rx.recv().await {
        let size = batch.len();
        match analytics.submit(batch).await {
            Ok(()) => {
                report.events_submitted += size;
                report.batches_submitted += 1;
                counter!("crm_sync_batches_flushed_total").increment(1);
                counter!("crm_sync_events_flushed_total").increment(size as u64);
            }
            Err(err) => {
                report.failed_batches += 1;
                report.events_failed += size;
                counter!("crm_sync_batches_failed_total").increment(1);
                warn!(events = size, error = %err, "analytics batch submission failed");
            }
        }
    }

    report
}
