//! `keep --case`: resolve depot paths that collide on a case-insensitive
//! filesystem.
//!
//! An entry is kept when its path is the exact on-disk spelling (or nothing
//! exists under any spelling) and no earlier entry claimed the same
//! case-folded path. On case-sensitive filesystems every entry is kept.

use super::Filter;
use crate::streaming::channel::Entry;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

pub struct KeepCase {
    root: PathBuf,
    enabled: bool,
    claimed: HashSet<String>,
    listings: HashMap<PathBuf, Option<Vec<String>>>,
}

impl KeepCase {
    pub fn new(root: impl Into<PathBuf>, case_insensitive: bool) -> Self {
        Self {
            root: root.into(),
            enabled: case_insensitive,
            claimed: HashSet::new(),
            listings: HashMap::new(),
        }
    }

    /// Whether `path` is spelled exactly as it exists on disk. Paths that do
    /// not exist under any spelling count as accurate.
    fn caseful_accurate(&mut self, path: &str) -> io::Result<bool> {
        let mut dir = self.root.clone();
        for part in path.split('/') {
            let names = match self.listing(&dir)? {
                Some(names) => names,
                None => return Ok(true),
            };
            if names.iter().any(|n| n == part) {
                dir.push(part);
                continue;
            }
            let folded = part.to_lowercase();
            return Ok(!names.iter().any(|n| n.to_lowercase() == folded));
        }
        Ok(true)
    }

    fn listing(&mut self, dir: &Path) -> io::Result<Option<&Vec<String>>> {
        if !self.listings.contains_key(dir) {
            let names = if dir.is_dir() {
                let mut names = Vec::new();
                for entry in std::fs::read_dir(dir)? {
                    names.push(entry?.file_name().to_string_lossy().into_owned());
                }
                Some(names)
            } else {
                None
            };
            self.listings.insert(dir.to_path_buf(), names);
        }
        Ok(self.listings.get(dir).and_then(|n| n.as_ref()))
    }
}

#[async_trait]
impl Filter for KeepCase {
    fn name(&self) -> &'static str {
        "keep-case"
    }

    async fn keep(&mut self, entry: &Entry) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let path = &entry.record.path;
        if !self.caseful_accurate(path)? {
            tracing::warn!(path = %path, "skipping path that case-mismatches a local file");
            return Ok(false);
        }
        if !self.claimed.insert(path.to_lowercase()) {
            tracing::warn!(path = %path, "skipping path that case-collides with an earlier entry");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Default for the current platform's usual filesystem.
pub fn platform_is_case_insensitive() -> bool {
    cfg!(any(target_os = "macos", target_os = "windows"))
}
