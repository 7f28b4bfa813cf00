//! Error taxonomy for depotsync.
//!
//! Transfer failures are recovered locally by annotating records; every other
//! variant is fatal for the run that raised it.

use thiserror::Error;

/// Maximum number of offending paths carried by a verification failure.
pub const MAX_REPORTED_PATHS: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },

    #[error("service redirected ({from}, {to}] to {redirect}, outside the requested range")]
    RedirectViolation { from: u64, to: u64, redirect: u64 },

    #[error("{count} file(s) failed verification:\n{}", format_paths(paths, *count))]
    VerificationFailed { count: usize, paths: Vec<String> },

    #[error("transfer command failed for {} path(s): {reason}", paths.len())]
    TransferFailed { paths: Vec<String>, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("corrupt state file {} at line {line}: {reason}", path.display())]
    CorruptState {
        path: std::path::PathBuf,
        line: u64,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn malformed(line: u64, reason: impl Into<String>) -> Self {
        SyncError::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }
}

fn format_paths(paths: &[String], count: usize) -> String {
    let mut out: Vec<String> = paths.iter().map(|p| format!("  {}", p)).collect();
    if count > paths.len() {
        out.push(format!("  ...and {} others", count - paths.len()));
    }
    out.join("\n")
}
