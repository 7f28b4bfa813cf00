//! Batcher ("manifold").
//!
//! Groups the entry stream into batches whose cumulative record size stays
//! within a byte cap. A record larger than the cap travels alone. Boundaries
//! depend only on record sizes and arrival order.

use crate::streaming::channel::{Batch, BatchSender, Entry, EntryReceiver};
use anyhow::Result;

pub struct Batcher {
    cap: u64,
    current: Vec<Entry>,
    bytes: u64,
    next_seq: u64,
}

impl Batcher {
    pub fn new(cap: u64) -> Self {
        Self {
            cap: cap.max(1),
            current: Vec::new(),
            bytes: 0,
            next_seq: 0,
        }
    }

    /// Add an entry. Returns the previous batch if this entry closed it.
    pub fn push(&mut self, entry: Entry) -> Option<Batch> {
        let size = entry.record.size;
        let closed = if !self.current.is_empty() && self.bytes.saturating_add(size) > self.cap {
            self.take()
        } else {
            None
        };
        self.bytes = self.bytes.saturating_add(size);
        self.current.push(entry);
        closed
    }

    /// Flush the open batch at end of input.
    pub fn finish(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            None
        } else {
            self.take()
        }
    }

    fn take(&mut self) -> Option<Batch> {
        let batch = Batch {
            seq: self.next_seq,
            entries: std::mem::take(&mut self.current),
            bytes: self.bytes,
        };
        self.next_seq += 1;
        self.bytes = 0;
        Some(batch)
    }
}

/// Run the batcher between an entry channel and the batch queue.
/// Returns the number of batches produced.
pub async fn run_batcher(mut rx: EntryReceiver, tx: BatchSender, cap: u64) -> Result<u64> {
    let mut batcher = Batcher::new(cap);
    let mut produced = 0u64;
    while let Some(entry) = rx.recv().await {
        if let Some(batch) = batcher.push(entry) {
            produced += 1;
            tx.send(batch)
                .await
                .map_err(|_| anyhow::anyhow!("Batch queue closed"))?;
        }
    }
    if let Some(batch) = batcher.finish() {
        produced += 1;
        tx.send(batch)
            .await
            .map_err(|_| anyhow::anyhow!("Batch queue closed"))?;
    }
    tracing::debug!(batches = produced, cap, "batcher done");
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Action, FileType, FstatRecord};
    use crate::streaming::channel::{batch_channel, entry_channel};
    use proptest::prelude::*;

    fn entry(i: usize, size: u64) -> Entry {
        Entry::new(FstatRecord::new(
            1,
            format!("f{}", i),
            1,
            Action::Add,
            FileType::Binary,
            size,
            "",
        ))
    }

    fn batch_all(sizes: &[u64], cap: u64) -> Vec<Batch> {
        let mut batcher = Batcher::new(cap);
        let mut out = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            out.extend(batcher.push(entry(i, *size)));
        }
        out.extend(batcher.finish());
        out
    }

    fn sizes_of(batch: &Batch) -> Vec<u64> {
        batch.records().map(|r| r.size).collect()
    }

    #[test]
    fn test_boundaries() {
        let batches = batch_all(&[4, 4, 4, 10, 1], 10);
        let shapes: Vec<Vec<u64>> = batches.iter().map(sizes_of).collect();
        assert_eq!(shapes, vec![vec![4, 4], vec![4], vec![10], vec![1]]);
        assert_eq!(batches[0].bytes, 8);
    }

    #[test]
    fn test_oversized_record_is_singleton() {
        let batches = batch_all(&[3, 25, 3], 10);
        let shapes: Vec<Vec<u64>> = batches.iter().map(sizes_of).collect();
        assert_eq!(shapes, vec![vec![3], vec![25], vec![3]]);
    }

    #[test]
    fn test_empty_input_makes_no_batch() {
        assert!(batch_all(&[], 10).is_empty());
    }

    #[test]
    fn test_sequence_numbers() {
        let batches = batch_all(&[6, 6, 6], 10);
        let seqs: Vec<u64> = batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_run_batcher() {
        let (in_tx, in_rx) = entry_channel(16);
        let (out_tx, mut out_rx) = batch_channel();
        for (i, size) in [5u64, 5, 5].iter().enumerate() {
            in_tx.send(entry(i, *size)).await.unwrap();
        }
        drop(in_tx);

        let produced = run_batcher(in_rx, out_tx, 10).await.unwrap();
        assert_eq!(produced, 2);
        assert_eq!(out_rx.recv().await.unwrap().len(), 2);
        assert_eq!(out_rx.recv().await.unwrap().len(), 1);
        assert!(out_rx.recv().await.is_none());
    }

    proptest! {
        #[test]
        fn prop_batch_containment(
            sizes in proptest::collection::vec(0u64..5_000, 0..200),
            cap in 1u64..10_000,
        ) {
            let batches = batch_all(&sizes, cap);

            for batch in &batches {
                prop_assert!(!batch.is_empty());
                let total: u64 = batch.records().map(|r| r.size).sum();
                prop_assert!(total <= cap || batch.len() == 1);
            }

            // Concatenating the batches reproduces the input in order.
            let flat: Vec<String> = batches
                .iter()
                .flat_map(|b| b.records().map(|r| r.path.clone()))
                .collect();
            let expected: Vec<String> = (0..sizes.len()).map(|i| format!("f{}", i)).collect();
            prop_assert_eq!(flat, expected);
        }

        #[test]
        fn prop_batching_is_deterministic(
            sizes in proptest::collection::vec(0u64..5_000, 0..100),
            cap in 1u64..10_000,
        ) {
            let first: Vec<Vec<u64>> = batch_all(&sizes, cap).iter().map(sizes_of).collect();
            let second: Vec<Vec<u64>> = batch_all(&sizes, cap).iter().map(sizes_of).collect();
            prop_assert_eq!(first, second);
        }
    }
}
