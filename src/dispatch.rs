//! Dispatcher ("gatling").
//!
//! N workers pull batches from one shared queue and run the transfer executor
//! once per batch. Records always continue downstream: a failed transfer is an
//! annotation on the entry, never a dropped record. Order is kept within a
//! batch only.

use crate::error::SyncError;
use crate::streaming::channel::{Batch, BatchReceiver, EntrySender, Outcome};
use crate::transfer::{TransferExecutor, TransferMode};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Counters for one dispatcher run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches: u64,
    pub transferred: u64,
    pub failed: u64,
}

impl DispatchStats {
    fn merge(&mut self, other: &DispatchStats) {
        self.batches += other.batches;
        self.transferred += other.transferred;
        self.failed += other.failed;
    }
}

pub struct Dispatcher {
    executor: Arc<dyn TransferExecutor>,
    workers: usize,
    mode: TransferMode,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn TransferExecutor>, workers: usize, mode: TransferMode) -> Self {
        Self {
            executor,
            workers: workers.max(1),
            mode,
        }
    }

    /// Consume `rx` until the batcher closes it, forwarding every entry to `tx`.
    pub async fn run(self, rx: BatchReceiver, tx: EntrySender) -> Result<DispatchStats> {
        let queue = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let queue = queue.clone();
            let tx = tx.clone();
            let executor = self.executor.clone();
            let mode = self.mode;
            handles.push(tokio::spawn(async move {
                run_worker(worker, queue, executor, mode, tx).await
            }));
        }
        drop(tx);

        let mut stats = DispatchStats::default();
        for result in futures::future::join_all(handles).await {
            stats.merge(&result??);
        }
        tracing::debug!(
            mode = self.mode.as_str(),
            batches = stats.batches,
            transferred = stats.transferred,
            failed = stats.failed,
            "dispatcher done"
        );
        Ok(stats)
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<Mutex<BatchReceiver>>,
    executor: Arc<dyn TransferExecutor>,
    mode: TransferMode,
    tx: EntrySender,
) -> Result<DispatchStats> {
    let mut stats = DispatchStats::default();
    loop {
        // Hold the lock only for the pop, not for the transfer.
        let next = { queue.lock().await.recv().await };
        let Some(mut batch) = next else {
            break;
        };
        stats.batches += 1;

        tracing::debug!(
            worker,
            seq = batch.seq,
            records = batch.len(),
            bytes = batch.bytes,
            mode = mode.as_str(),
            "transferring batch"
        );
        let result = executor.execute(&batch, mode).await;
        annotate(&mut batch, result);

        for entry in batch.entries {
            match entry.outcome {
                Outcome::Failed(_) => stats.failed += 1,
                _ => stats.transferred += 1,
            }
            tx.send(entry)
                .await
                .map_err(|_| anyhow::anyhow!("dispatcher: downstream closed"))?;
        }
    }
    Ok(stats)
}

fn annotate(batch: &mut Batch, result: Result<Vec<Outcome>>) {
    let outcomes = match result {
        Ok(outcomes) if outcomes.len() == batch.len() => outcomes,
        Ok(outcomes) => {
            let reason = format!(
                "executor returned {} outcomes for {} records",
                outcomes.len(),
                batch.len()
            );
            failed_batch(batch, reason)
        }
        Err(e) => failed_batch(batch, format!("{:#}", e)),
    };

    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::Failed(_)))
        .count();
    if failed > 0 {
        tracing::warn!(seq = batch.seq, failed, records = batch.len(), "transfer failed");
    }
    for (entry, outcome) in batch.entries.iter_mut().zip(outcomes) {
        entry.outcome = outcome;
    }
}

/// Every record of `batch` fails with the same cause.
fn failed_batch(batch: &Batch, reason: String) -> Vec<Outcome> {
    let err = SyncError::TransferFailed {
        paths: batch.records().map(|r| r.spec()).collect(),
        reason,
    };
    tracing::debug!(seq = batch.seq, "{}", err);
    vec![Outcome::Failed(err.to_string()); batch.len()]
}
