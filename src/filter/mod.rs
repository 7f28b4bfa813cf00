//! Filter stages.
//!
//! A filter reads one entry at a time and either forwards it unchanged or
//! drops it. Filters never duplicate or reorder the entries they forward.

pub mod case;
pub mod checksum;
pub mod fail;
pub mod havelist;
pub mod progress;

pub use case::KeepCase;
pub use checksum::DropChecksum;
pub use fail::{fail, FailReport};
pub use havelist::DropHaveList;
pub use progress::Progress;

use crate::streaming::channel::{Entry, EntryReceiver, EntrySender, StageStats};
use anyhow::Result;
use async_trait::async_trait;

/// A per-entry predicate.
#[async_trait]
pub trait Filter: Send {
    /// Stage name for logs
    fn name(&self) -> &'static str;

    /// Whether `entry` should be forwarded downstream.
    async fn keep(&mut self, entry: &Entry) -> Result<bool>;

    /// Called once after the input is exhausted.
    fn finish(&mut self) {}
}

/// Drive a filter from `rx` to `tx` until upstream closes.
pub async fn run_filter<F: Filter + ?Sized>(
    filter: &mut F,
    mut rx: EntryReceiver,
    tx: EntrySender,
) -> Result<StageStats> {
    let mut stats = StageStats::default();
    while let Some(entry) = rx.recv().await {
        stats.seen += 1;
        if filter.keep(&entry).await? {
            stats.forwarded += 1;
            tx.send(entry)
                .await
                .map_err(|_| anyhow::anyhow!("{}: downstream closed", filter.name()))?;
        } else {
            tracing::trace!(stage = filter.name(), path = %entry.record.path, "dropped");
        }
    }
    filter.finish();
    tracing::debug!(
        stage = filter.name(),
        seen = stats.seen,
        forwarded = stats.forwarded,
        "filter done"
    );
    Ok(stats)
}
