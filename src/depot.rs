//! The authoritative source of fstat records.
//!
//! [`CommandDepot`] talks to the real repository through configured command
//! templates. [`MemoryDepot`] keeps numbered changes in memory and backs the
//! mirror transfer executor in tests.

use crate::error::SyncError;
use crate::record::{Action, FileType, FstatRecord};
use crate::streaming::codec::decode_all;
use crate::transfer::mirror_digest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

/// Attempts made for one depot command before giving up
pub const DEPOT_ATTEMPTS: u32 = 3;

const RETRY_DELAY: Duration = Duration::from_millis(250);

#[async_trait]
pub trait Depot: Send + Sync {
    /// Records changed in `(from, to]` under `prefix`, one per path, latest wins.
    async fn fstat(&self, prefix: &str, from: u64, to: u64) -> Result<Vec<FstatRecord>>;

    /// Highest changelist submitted under `prefix`.
    async fn head(&self, prefix: &str) -> Result<u64>;
}

/// Keep records with `from < change <= to`, one per path (highest change
/// wins), sorted by path.
pub fn latest_per_path(
    records: impl IntoIterator<Item = FstatRecord>,
    from: u64,
    to: u64,
) -> Vec<FstatRecord> {
    let mut latest: HashMap<String, FstatRecord> = HashMap::new();
    for record in records {
        if record.change <= from || record.change > to {
            continue;
        }
        match latest.get(&record.path) {
            Some(existing) if existing.change > record.change => {}
            _ => {
                latest.insert(record.path.clone(), record);
            }
        }
    }
    let mut out: Vec<FstatRecord> = latest.into_values().collect();
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

// =============================================================================
// CommandDepot
// =============================================================================

/// Depot reached through external commands whose stdout is a record stream.
///
/// Templates are split on whitespace; `{prefix}`, `{from}` and `{to}` are
/// substituted in every word.
#[derive(Debug, Clone)]
pub struct CommandDepot {
    fstat_command: String,
    head_command: Option<String>,
}

impl CommandDepot {
    pub fn new(fstat_command: impl Into<String>, head_command: Option<String>) -> Self {
        Self {
            fstat_command: fstat_command.into(),
            head_command,
        }
    }

    fn render(template: &str, prefix: &str, from: u64, to: u64) -> Result<Vec<String>, SyncError> {
        let words: Vec<String> = template
            .split_whitespace()
            .map(|w| {
                w.replace("{prefix}", prefix)
                    .replace("{from}", &from.to_string())
                    .replace("{to}", &to.to_string())
            })
            .collect();
        if words.is_empty() {
            return Err(SyncError::Config("depot command is empty".to_string()));
        }
        Ok(words)
    }

    async fn run(words: &[String]) -> Result<String> {
        let mut last_err = None;
        for attempt in 1..=DEPOT_ATTEMPTS {
            match Self::run_once(words).await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    tracing::warn!(
                        command = %words[0],
                        attempt,
                        error = %e,
                        "depot command failed"
                    );
                    last_err = Some(e);
                    if attempt < DEPOT_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("depot command never ran")))
    }

    async fn run_once(words: &[String]) -> Result<String> {
        let output = Command::new(&words[0])
            .args(&words[1..])
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", words[0]))?;
        if !output.status.success() {
            anyhow::bail!("{} exited with {}", words[0], output.status);
        }
        String::from_utf8(output.stdout).context("Depot output is not UTF-8")
    }
}

#[async_trait]
impl Depot for CommandDepot {
    async fn fstat(&self, prefix: &str, from: u64, to: u64) -> Result<Vec<FstatRecord>> {
        let words = Self::render(&self.fstat_command, prefix, from, to)?;
        let output = Self::run(&words).await?;
        let records = decode_all(&output)?;
        tracing::debug!(prefix, from, to, records = records.len(), "depot fstat");
        Ok(latest_per_path(records, from, to))
    }

    async fn head(&self, prefix: &str) -> Result<u64> {
        let template = self
            .head_command
            .as_deref()
            .ok_or_else(|| SyncError::Config("no depot head command configured".to_string()))?;
        let words = Self::render(template, prefix, 0, 0)?;
        let output = Self::run(&words).await?;
        let head = output.trim();
        head.parse()
            .map_err(|_| SyncError::Protocol(format!("depot head returned {:?}", head)).into())
    }
}

// =============================================================================
// MemoryDepot
// =============================================================================

#[derive(Debug, Clone)]
struct Revision {
    record: FstatRecord,
    content: Vec<u8>,
}

/// In-memory depot: every prefix holds a list of submitted revisions.
#[derive(Debug, Default)]
pub struct MemoryDepot {
    prefixes: Mutex<HashMap<String, Vec<Revision>>>,
}

impl MemoryDepot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit one file revision at `change` and return its record.
    pub fn submit(
        &self,
        prefix: &str,
        change: u64,
        path: &str,
        action: Action,
        file_type: FileType,
        content: &[u8],
    ) -> FstatRecord {
        let (size, digest) = if action == Action::Delete {
            (0, String::new())
        } else {
            (content.len() as u64, mirror_digest(content, file_type))
        };

        let mut prefixes = match self.prefixes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let revisions = prefixes.entry(prefix.to_string()).or_default();
        let rev = revisions
            .iter()
            .filter(|r| r.record.path == path)
            .map(|r| r.record.rev)
            .max()
            .unwrap_or(0)
            + 1;

        let record = FstatRecord::new(change, path, rev, action, file_type, size, digest);
        revisions.push(Revision {
            record: record.clone(),
            content: content.to_vec(),
        });
        record
    }

    /// Content of `path#rev`, if it was submitted.
    pub fn content(&self, prefix: &str, path: &str, rev: u64) -> Option<Vec<u8>> {
        let prefixes = self.prefixes.lock().ok()?;
        prefixes
            .get(prefix)?
            .iter()
            .find(|r| r.record.path == path && r.record.rev == rev)
            .map(|r| r.content.clone())
    }

    fn records(&self, prefix: &str) -> Vec<FstatRecord> {
        match self.prefixes.lock() {
            Ok(prefixes) => prefixes
                .get(prefix)
                .map(|revs| revs.iter().map(|r| r.record.clone()).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl Depot for MemoryDepot {
    async fn fstat(&self, prefix: &str, from: u64, to: u64) -> Result<Vec<FstatRecord>> {
        Ok(latest_per_path(self.records(prefix), from, to))
    }

    async fn head(&self, prefix: &str) -> Result<u64> {
        Ok(self
            .records(prefix)
            .iter()
            .map(|r| r.change)
            .max()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_depot() -> MemoryDepot {
        let depot = MemoryDepot::new();
        depot.submit("//depot", 10, "a.txt", Action::Add, FileType::Text, b"one");
        depot.submit("//depot", 11, "b.txt", Action::Add, FileType::Binary, b"\x00\x01");
        depot.submit("//depot", 12, "a.txt", Action::Edit, FileType::Text, b"two");
        depot.submit("//depot", 13, "b.txt", Action::Delete, FileType::Binary, b"");
        depot.submit("//other", 99, "c.txt", Action::Add, FileType::Text, b"c");
        depot
    }

    #[tokio::test]
    async fn test_latest_action_wins() {
        let depot = sample_depot();
        let records = depot.fstat("//depot", 0, 13).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "a.txt");
        assert_eq!(records[0].rev, 2);
        assert_eq!(records[0].change, 12);
        assert!(records[1].is_delete());
        assert!(records[1].digest.is_empty());
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let depot = sample_depot();
        let records = depot.fstat("//depot", 10, 11).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "b.txt");

        assert!(depot.fstat("//depot", 13, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_head_per_prefix() {
        let depot = sample_depot();
        assert_eq!(depot.head("//depot").await.unwrap(), 13);
        assert_eq!(depot.head("//other").await.unwrap(), 99);
        assert_eq!(depot.head("//missing").await.unwrap(), 0);
    }

    #[test]
    fn test_content_by_revision() {
        let depot = sample_depot();
        assert_eq!(depot.content("//depot", "a.txt", 1).unwrap(), b"one");
        assert_eq!(depot.content("//depot", "a.txt", 2).unwrap(), b"two");
        assert!(depot.content("//depot", "a.txt", 3).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_depot_decodes_stdout() {
        let depot = CommandDepot::new(
            "printf 12,a.txt,2,edit,text,3,5D41402ABC4B2A76B9719D911017C592\\n",
            Some("echo 42".to_string()),
        );
        let records = depot.fstat("//depot", 0, 20).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "a.txt");
        assert_eq!(depot.head("//depot").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_command_depot_without_head_command() {
        let depot = CommandDepot::new("true", None);
        let err = depot.head("//depot").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Config(_))
        ));
    }
}
