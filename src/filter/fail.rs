//! `fail`: terminal stage. Any entry reaching it fails the run.

use crate::error::{SyncError, MAX_REPORTED_PATHS};
use crate::streaming::channel::{EntryReceiver, Outcome};
use colored::Colorize;

/// What reached the fail stage.
#[derive(Debug, Default)]
pub struct FailReport {
    pub count: usize,
    /// First paths (`path#rev`), sorted, capped at [`MAX_REPORTED_PATHS`]
    pub paths: Vec<String>,
    /// Entries whose last transfer command reported failure
    pub transfer_failures: usize,
}

impl FailReport {
    pub fn into_error(self) -> SyncError {
        SyncError::VerificationFailed {
            count: self.count,
            paths: self.paths,
        }
    }
}

/// Drain `rx`. Empty input is success; otherwise the rejected files are
/// printed as a banner on stderr and a `VerificationFailed` is returned.
pub async fn fail(mut rx: EntryReceiver) -> Result<(), SyncError> {
    let mut report = FailReport::default();
    while let Some(entry) = rx.recv().await {
        report.count += 1;
        if let Outcome::Failed(reason) = &entry.outcome {
            report.transfer_failures += 1;
            tracing::debug!(path = %entry.record.path, %reason, "transfer failure reached fail stage");
        }
        if report.paths.len() < MAX_REPORTED_PATHS {
            report.paths.push(entry.record.spec());
        }
    }
    if report.count == 0 {
        return Ok(());
    }

    report.paths.sort();
    print_banner(&report);
    Err(report.into_error())
}

fn print_banner(report: &FailReport) {
    let header = " depotsync ERROR ";
    let side = "*".repeat((78 - header.len()) / 2);
    let rule = "*".repeat(side.len() * 2 + header.len());
    eprintln!();
    eprintln!("{}", format!("{}{}{}", side, header, side).red().bold());
    eprintln!("These files did not sync:");
    for path in &report.paths {
        eprintln!("  {}", path);
    }
    if report.count > report.paths.len() {
        eprintln!("  ...and {} others!", report.count - report.paths.len());
    }
    if report.transfer_failures > 0 {
        eprintln!(
            "{} of them also failed the transfer command.",
            report.transfer_failures
        );
    }
    eprintln!("{}", rule.red().bold());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Action, FileType, FstatRecord};
    use crate::streaming::channel::{entry_channel, Entry};

    #[tokio::test]
    async fn test_empty_input_succeeds() {
        let (tx, rx) = entry_channel(1);
        drop(tx);
        assert!(fail(rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_any_entry_fails_naming_path() {
        let (tx, rx) = entry_channel(4);
        let mut entry = Entry::new(FstatRecord::new(7, "X", 3, Action::Edit, FileType::Text, 1, ""));
        entry.outcome = Outcome::Failed("exit status 1".to_string());
        tx.send(entry).await.unwrap();
        drop(tx);

        match fail(rx).await {
            Err(SyncError::VerificationFailed { count, paths }) => {
                assert_eq!(count, 1);
                assert_eq!(paths, vec!["X#3".to_string()]);
            }
            other => panic!("expected VerificationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_report_is_capped() {
        let (tx, rx) = entry_channel(256);
        for i in 0..150u64 {
            let r = FstatRecord::new(1, format!("f{:03}", i), 1, Action::Add, FileType::Text, 0, "");
            tx.send(Entry::new(r)).await.unwrap();
        }
        drop(tx);

        match fail(rx).await {
            Err(SyncError::VerificationFailed { count, paths }) => {
                assert_eq!(count, 150);
                assert_eq!(paths.len(), MAX_REPORTED_PATHS);
            }
            other => panic!("expected VerificationFailed, got {:?}", other),
        }
    }
}
