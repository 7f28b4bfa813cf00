//! `drop --checksum`: drop entries whose local file already matches.

use super::Filter;
use crate::checksum::matches_local;
use crate::streaming::channel::Entry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub struct DropChecksum {
    root: Arc<PathBuf>,
}

impl DropChecksum {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }
}

#[async_trait]
impl Filter for DropChecksum {
    fn name(&self) -> &'static str {
        "drop-checksum"
    }

    async fn keep(&mut self, entry: &Entry) -> Result<bool> {
        let root = Arc::clone(&self.root);
        let record = entry.record.clone();
        // Hashing is blocking file I/O
        let matched = tokio::task::spawn_blocking(move || matches_local(&root, &record))
            .await?
            .with_context(|| format!("Failed to checksum {}", entry.record.path))?;
        Ok(!matched)
    }
}
