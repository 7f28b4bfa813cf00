//! `drop --havelist`: drop entries the have-list already records as synced.

use super::Filter;
use crate::state::HaveList;
use crate::streaming::channel::Entry;
use anyhow::Result;
use async_trait::async_trait;

pub struct DropHaveList {
    have: HaveList,
}

impl DropHaveList {
    pub fn new(have: HaveList) -> Self {
        Self { have }
    }
}

#[async_trait]
impl Filter for DropHaveList {
    fn name(&self) -> &'static str {
        "drop-havelist"
    }

    async fn keep(&mut self, entry: &Entry) -> Result<bool> {
        let synced = self
            .have
            .get(&entry.record.path)
            .map(|have| have.change >= entry.record.change)
            .unwrap_or(false);
        Ok(!synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Action, FileType, FstatRecord};
    use crate::state::HaveEntry;

    fn entry(path: &str, change: u64) -> Entry {
        Entry::new(FstatRecord::new(change, path, 1, Action::Edit, FileType::Text, 0, ""))
    }

    #[tokio::test]
    async fn test_drops_at_or_above_have() {
        let mut have = HaveList::new();
        have.insert(
            "a.txt".to_string(),
            HaveEntry {
                change: 100,
                digest: String::new(),
            },
        );
        let mut filter = DropHaveList::new(have);

        assert!(!filter.keep(&entry("a.txt", 90)).await.unwrap());
        assert!(!filter.keep(&entry("a.txt", 100)).await.unwrap());
        assert!(filter.keep(&entry("a.txt", 101)).await.unwrap());
        assert!(filter.keep(&entry("b.txt", 1)).await.unwrap());
    }
}
