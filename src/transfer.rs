//! Transfer executors.
//!
//! The dispatcher hands each batch to a [`TransferExecutor`]. The executor
//! reports one outcome per record; an `Err` means the whole invocation failed
//! and every record in the batch is annotated as failed.

use crate::checksum::content_digest;
use crate::depot::MemoryDepot;
use crate::error::SyncError;
use crate::record::{FileType, FstatRecord};
use crate::streaming::channel::{Batch, Outcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default format of one path line written to the transfer command
pub const DEFAULT_PATH_FORMAT: &str = "{prefix}/{path}#{rev}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Regular transfer; the command may skip files it believes are current
    Normal,
    /// Overwrite regardless of local state
    Force,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Normal => "normal",
            TransferMode::Force => "force",
        }
    }
}

/// Fetches the files named by a batch into the local tree.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Transfer every record of `batch`. Returns one outcome per record, in
    /// batch order.
    async fn execute(&self, batch: &Batch, mode: TransferMode) -> Result<Vec<Outcome>>;
}

// =============================================================================
// CommandTransfer
// =============================================================================

/// Runs an external client once per batch, one path per line on its stdin.
#[derive(Debug, Clone)]
pub struct CommandTransfer {
    program: String,
    args: Vec<String>,
    force_args: Vec<String>,
    path_format: String,
    prefix: String,
    root: PathBuf,
}

impl CommandTransfer {
    /// `command` is split on whitespace; the first word is the program.
    pub fn new(command: &str, prefix: &str, root: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| SyncError::Config("transfer command is empty".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
            force_args: vec!["-f".to_string()],
            path_format: DEFAULT_PATH_FORMAT.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
            root: root.into(),
        })
    }

    pub fn with_force_args(mut self, force_args: Vec<String>) -> Self {
        self.force_args = force_args;
        self
    }

    pub fn with_path_format(mut self, path_format: impl Into<String>) -> Self {
        self.path_format = path_format.into();
        self
    }

    /// The line written to the command for `record`.
    pub fn format_path(&self, record: &FstatRecord) -> String {
        self.path_format
            .replace("{prefix}", &self.prefix)
            .replace("{path}", &record.path)
            .replace("{rev}", &record.rev.to_string())
            .replace("{change}", &record.change.to_string())
    }
}

#[async_trait]
impl TransferExecutor for CommandTransfer {
    async fn execute(&self, batch: &Batch, mode: TransferMode) -> Result<Vec<Outcome>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if mode == TransferMode::Force {
            cmd.args(&self.force_args);
        }
        cmd.current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn transfer command {}", self.program))?;

        let mut stdin = child.stdin.take().context("Failed to open stdin")?;
        let mut input = String::new();
        for record in batch.records() {
            input.push_str(&self.format_path(record));
            input.push('\n');
        }
        let written: std::io::Result<()> = async {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await
        }
        .await;
        drop(stdin);
        if let Err(e) = written {
            // Reap the child before giving up on the batch.
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e).with_context(|| format!("Failed to write paths to {}", self.program));
        }

        let status = child.wait().await?;
        let outcome = if status.success() {
            Outcome::Transferred
        } else {
            Outcome::Failed(format!("{} exited with {}", self.program, status))
        };
        Ok(vec![outcome; batch.len()])
    }
}

// =============================================================================
// MirrorTransfer
// =============================================================================

/// Materializes files from a [`MemoryDepot`] into a local root.
///
/// Faults can be injected per path: a failure reports the record as failed
/// without touching the file, a corruption writes the wrong bytes and reports
/// success.
pub struct MirrorTransfer {
    depot: Arc<MemoryDepot>,
    prefix: String,
    root: PathBuf,
    failures: Mutex<HashMap<String, u32>>,
    corruptions: Mutex<HashMap<String, u32>>,
    invocations: AtomicU64,
    transferred: AtomicU64,
}

impl MirrorTransfer {
    pub fn new(depot: Arc<MemoryDepot>, prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            depot,
            prefix: prefix.into(),
            root: root.into(),
            failures: Mutex::new(HashMap::new()),
            corruptions: Mutex::new(HashMap::new()),
            invocations: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
        }
    }

    /// Fail the next `times` transfers of `path`.
    pub fn inject_failure(&self, path: &str, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(path.to_string(), times);
        }
    }

    /// Corrupt the next `times` transfers of `path`.
    pub fn inject_corruption(&self, path: &str, times: u32) {
        if let Ok(mut corruptions) = self.corruptions.lock() {
            corruptions.insert(path.to_string(), times);
        }
    }

    /// Number of `execute` calls so far
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Number of records written (or removed) so far
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn take_fault(faults: &Mutex<HashMap<String, u32>>, path: &str) -> bool {
        let Ok(mut faults) = faults.lock() else {
            return false;
        };
        match faults.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn materialize(&self, record: &FstatRecord, corrupt: bool) -> Result<()> {
        let path = record.local_path(&self.root);

        if record.is_delete() {
            match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) if !meta.is_dir() => tokio::fs::remove_file(&path).await?,
                _ => {}
            }
            return Ok(());
        }

        let content = self
            .depot
            .content(&self.prefix, &record.path, record.rev)
            .with_context(|| format!("{} is not in the depot", record.spec()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Ok(meta) = tokio::fs::symlink_metadata(&path).await {
            if meta.file_type().is_symlink() || record.file_type == FileType::Symlink {
                tokio::fs::remove_file(&path).await?;
            }
        }

        if record.file_type == FileType::Symlink && !corrupt {
            let target = String::from_utf8_lossy(&content).into_owned();
            return make_symlink(&target, &path).await;
        }

        let bytes = if corrupt {
            let mut wrong = content.clone();
            wrong.extend_from_slice(b"\0corrupt");
            wrong
        } else {
            content
        };
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl TransferExecutor for MirrorTransfer {
    async fn execute(&self, batch: &Batch, mode: TransferMode) -> Result<Vec<Outcome>> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let mut outcomes = Vec::with_capacity(batch.len());

        for record in batch.records() {
            if Self::take_fault(&self.failures, &record.path) {
                outcomes.push(Outcome::Failed(format!(
                    "injected failure ({} transfer)",
                    mode.as_str()
                )));
                continue;
            }
            let corrupt = Self::take_fault(&self.corruptions, &record.path);
            match self.materialize(record, corrupt).await {
                Ok(()) => {
                    self.transferred.fetch_add(1, Ordering::Relaxed);
                    outcomes.push(Outcome::Transferred);
                }
                Err(e) => outcomes.push(Outcome::Failed(e.to_string())),
            }
        }
        Ok(outcomes)
    }
}

#[cfg(unix)]
async fn make_symlink(target: &str, link: &Path) -> Result<()> {
    tokio::fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_symlink(target: &str, link: &Path) -> Result<()> {
    // No portable symlink; keep the target as content.
    tokio::fs::write(link, target.as_bytes()).await?;
    Ok(())
}

/// Digest a mirror would produce for `content` of the given type.
pub fn mirror_digest(content: &[u8], file_type: FileType) -> String {
    match file_type {
        FileType::Utf16 => content_digest(crate::checksum::decode_utf16(content).as_bytes()),
        _ => content_digest(content),
    }
}
