//! Channel types for the record pipeline.
//!
//! Stages are connected by bounded channels, so a slow consumer applies
//! backpressure all the way up to the record source.

use crate::record::FstatRecord;
use tokio::sync::mpsc;

/// Default capacity of the channel between two stages
pub const STAGE_CHANNEL_SIZE: usize = 1024;

/// Capacity of the batch queue feeding the dispatcher workers
pub const BATCH_CHANNEL_SIZE: usize = 16;

/// Default byte cap for one batch
pub const DEFAULT_BATCH_BYTES: u64 = 10 * 1024 * 1024; // 10MB

/// Default number of dispatcher workers
pub const DEFAULT_WORKERS: usize = 4;

// =============================================================================
// Entry: the unit flowing between stages
// =============================================================================

/// Result of the most recent transfer attempt for a record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Not transferred by this pipeline (yet)
    #[default]
    Pending,
    /// The transfer command reported success
    Transferred,
    /// The transfer command failed; the reason is kept for reporting
    Failed(String),
}

/// A record plus its transfer annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub record: FstatRecord,
    pub outcome: Outcome,
}

impl Entry {
    pub fn new(record: FstatRecord) -> Self {
        Self {
            record,
            outcome: Outcome::Pending,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

impl From<FstatRecord> for Entry {
    fn from(record: FstatRecord) -> Self {
        Entry::new(record)
    }
}

// =============================================================================
// Batch: Batcher -> Dispatcher
// =============================================================================

/// An ordered, non-empty group of entries dispatched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub seq: u64,
    pub entries: Vec<Entry>,
    /// Sum of the record sizes in bytes
    pub bytes: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &FstatRecord> {
        self.entries.iter().map(|e| &e.record)
    }
}

// =============================================================================
// Channel types
// =============================================================================

pub type EntrySender = mpsc::Sender<Entry>;
pub type EntryReceiver = mpsc::Receiver<Entry>;
pub type BatchSender = mpsc::Sender<Batch>;
pub type BatchReceiver = mpsc::Receiver<Batch>;

/// Create a bounded channel between two record stages
pub fn entry_channel(capacity: usize) -> (EntrySender, EntryReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Create the bounded batch queue between Batcher and Dispatcher
pub fn batch_channel() -> (BatchSender, BatchReceiver) {
    mpsc::channel(BATCH_CHANNEL_SIZE)
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for one pass of a pipeline.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageStats {
    /// Entries read from upstream
    pub seen: u64,
    /// Entries forwarded downstream
    pub forwarded: u64,
}

impl StageStats {
    pub fn dropped(&self) -> u64 {
        self.seen - self.forwarded
    }
}
