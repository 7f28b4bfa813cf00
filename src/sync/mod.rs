//! Reconciliation controller.
//!
//! One sync runs a fixed sequence of phases, each streaming its records
//! through a pipeline and handing the survivors to the next:
//!
//! ```text
//! QUERYING -> FILTERING -> TRANSFERRING -> VERIFYING
//!          -> TRANSFERRING (force) -> VERIFYING -> DONE | FAILED
//! ```
//!
//! Transfer failures never abort a phase. They stay on the entry, and the
//! following checksum pass picks the file up again. Local state is written
//! only after the last verification comes back empty.

pub mod clean;
pub mod query;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::depot::Depot;
use crate::error::SyncError;
use crate::filter::{fail, DropChecksum, DropHaveList, KeepCase, Progress};
use crate::record::{Action, FstatRecord};
use crate::state::{LocalState, StateLock};
use crate::streaming::channel::{entry_channel, Entry};
use crate::streaming::pipeline::{Pipeline, PipelineOptions, StageReport};
use crate::transfer::{TransferExecutor, TransferMode};
use crate::transport::ServiceClient;
use query::{query_range, QuerySource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Querying,
    Filtering,
    Transferring,
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Querying => "QUERYING",
            SyncPhase::Filtering => "FILTERING",
            SyncPhase::Transferring => "TRANSFERRING",
            SyncPhase::Verifying => "VERIFYING",
            SyncPhase::Done => "DONE",
            SyncPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Summary of one sync.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub prefix: String,
    pub from: u64,
    pub to: u64,
    /// Records returned by the query
    pub queried: u64,
    /// Records dropped before the first transfer
    pub dropped_pre: u64,
    /// Records handed to the normal transfer
    pub transferred_first: u64,
    /// Records handed to the forced transfer
    pub transferred_second: u64,
    /// Transfer-command failures across both rounds
    pub failed_transfers: u64,
    /// Local files moved away (or deleted) by `clean`
    pub cleaned: u64,
    /// Nothing to do: the directory was already at the target
    pub already_synced: bool,
    pub source: Option<QuerySource>,
    /// Phases entered, in order
    pub phases: Vec<SyncPhase>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn final_phase(&self) -> Option<SyncPhase> {
        self.phases.last().copied()
    }
}

/// What to sync.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub root: PathBuf,
    /// Depot prefix; defaults to the one recorded in the local state
    pub prefix: Option<String>,
    /// Target changelist; defaults to the depot head
    pub target: Option<u64>,
    /// Re-verify everything from changelist 0
    pub force: bool,
}

impl SyncRequest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: None,
            target: None,
            force: false,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn at(mut self, target: u64) -> Self {
        self.target = Some(target);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

pub struct Reconciler {
    depot: Arc<dyn Depot>,
    executor: Arc<dyn TransferExecutor>,
    service: Option<ServiceClient>,
    options: PipelineOptions,
    case_insensitive: bool,
    havelist: bool,
    progress: bool,
}

impl Reconciler {
    pub fn new(
        depot: Arc<dyn Depot>,
        executor: Arc<dyn TransferExecutor>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            depot,
            executor,
            service: None,
            options,
            case_insensitive: false,
            havelist: true,
            progress: false,
        }
    }

    pub fn with_service(mut self, service: Option<ServiceClient>) -> Self {
        self.service = service;
        self
    }

    pub fn case_insensitive(mut self, on: bool) -> Self {
        self.case_insensitive = on;
        self
    }

    pub fn havelist(mut self, on: bool) -> Self {
        self.havelist = on;
        self
    }

    /// Draw progress spinners on a terminal.
    pub fn progress(mut self, on: bool) -> Self {
        self.progress = on;
        self
    }

    pub fn depot(&self) -> &dyn Depot {
        self.depot.as_ref()
    }

    pub fn service(&self) -> Option<&ServiceClient> {
        self.service.as_ref()
    }

    /// Bring `request.root` to the target changelist or fail.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncReport> {
        let _lock = StateLock::acquire(&request.root)?;
        let mut state = LocalState::open(&request.root)?;
        let prefix = resolve_prefix(request.prefix.as_deref(), &state)?;
        let target = match request.target {
            Some(t) => t,
            None => self.head(&prefix).await?,
        };
        self.sync_locked(&mut state, &prefix, target, request.force)
            .await
    }

    /// Depot head for `prefix`.
    pub async fn head(&self, prefix: &str) -> Result<u64> {
        self.depot
            .head(prefix)
            .await
            .with_context(|| format!("Failed to get head changelist of {}", prefix))
    }

    fn progress_stage(&self, label: &str) -> Progress {
        if self.progress {
            Progress::new(label)
        } else {
            Progress::hidden(label)
        }
    }

    pub(crate) async fn sync_locked(
        &self,
        state: &mut LocalState,
        prefix: &str,
        target: u64,
        force: bool,
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let root = state.root().to_path_buf();
        let last = state.changelist();
        let prefix_changed = state.prefix().is_some_and(|p| p != prefix);
        let mut phases = PhaseTracker::default();

        let mut report = SyncReport {
            prefix: prefix.to_string(),
            to: target,
            ..Default::default()
        };

        if !force && !prefix_changed && last == target && state.prefix().is_some() {
            tracing::info!(prefix, changelist = target, "already synced");
            report.from = last;
            report.already_synced = true;
            phases.enter(SyncPhase::Done);
            report.phases = phases.finish();
            report.duration = start.elapsed();
            return Ok(report);
        }

        // Going backwards or switching prefix needs the full state at target.
        let full = force || prefix_changed || target < last;
        report.from = if full { 0 } else { last };

        // QUERYING
        phases.enter(SyncPhase::Querying);
        let queried = query_range(
            self.depot.as_ref(),
            self.service.as_ref(),
            prefix,
            report.from,
            target,
        )
        .await?;
        report.source = Some(queried.source);
        let mut requested: Vec<FstatRecord> = queried.records;
        if target < last && !prefix_changed {
            let removed = self.added_since(prefix, target, last, &requested).await?;
            if !removed.is_empty() {
                tracing::info!(prefix, count = removed.len(), "removing files added after target");
                requested.extend(removed);
                requested.sort_by(|a, b| a.path.cmp(&b.path));
            }
        }
        report.queried = requested.len() as u64;
        let entries: Vec<Entry> = requested.iter().cloned().map(Entry::new).collect();

        // FILTERING
        phases.enter(SyncPhase::Filtering);
        let mut pre = Pipeline::new(self.options);
        if self.havelist && !full {
            pre = pre.filter(DropHaveList::new(state.have().clone()));
        }
        let pre = pre
            .filter(DropChecksum::new(&root))
            .filter(KeepCase::new(&root, self.case_insensitive))
            .filter(self.progress_stage("checking"));
        let (survivors, _) = pre.collect(entries).await?;
        report.dropped_pre = report.queried - survivors.len() as u64;

        // TRANSFERRING
        phases.enter(SyncPhase::Transferring);
        let (first, reports) = self.transfer(survivors, TransferMode::Normal).await?;
        report.transferred_first = first.len() as u64;
        report.failed_transfers += failed_in(&reports);

        // VERIFYING
        phases.enter(SyncPhase::Verifying);
        let (mismatched, _) = Pipeline::new(self.options)
            .filter(DropChecksum::new(&root))
            .collect(first)
            .await?;

        // TRANSFERRING, forced
        phases.enter(SyncPhase::Transferring);
        let (second, reports) = self.transfer(mismatched, TransferMode::Force).await?;
        report.transferred_second = second.len() as u64;
        report.failed_transfers += failed_in(&reports);

        // VERIFYING, then fail
        phases.enter(SyncPhase::Verifying);
        let (remaining, _) = Pipeline::new(self.options)
            .filter(DropChecksum::new(&root))
            .collect(second)
            .await?;

        let (tx, rx) = entry_channel(remaining.len().max(1));
        for entry in remaining {
            tx.send(entry)
                .await
                .map_err(|_| anyhow::anyhow!("fail stage closed"))?;
        }
        drop(tx);
        if let Err(e) = fail(rx).await {
            phases.enter(SyncPhase::Failed);
            tracing::error!(prefix, changelist = target, "sync failed verification");
            return Err(e.into());
        }

        if full {
            state.clear_have();
        }
        if self.havelist {
            state.record_synced(&requested);
        }
        state.set_prefix(prefix)?;
        state.set_changelist(target);
        state.save()?;

        phases.enter(SyncPhase::Done);
        report.phases = phases.finish();
        report.duration = start.elapsed();
        tracing::info!(
            prefix,
            from = report.from,
            to = target,
            queried = report.queried,
            transferred = report.transferred_first,
            forced = report.transferred_second,
            elapsed_ms = report.duration.as_millis() as u64,
            "sync complete"
        );
        Ok(report)
    }

    /// Delete records for paths that appear in `(target, last]` but not in
    /// `at_target`, the state at `target`. Those files were added after the
    /// target and must go when syncing backwards.
    async fn added_since(
        &self,
        prefix: &str,
        target: u64,
        last: u64,
        at_target: &[FstatRecord],
    ) -> Result<Vec<FstatRecord>> {
        let later = query_range(
            self.depot.as_ref(),
            self.service.as_ref(),
            prefix,
            target,
            last,
        )
        .await?;
        let known: HashSet<&str> = at_target.iter().map(|r| r.path.as_str()).collect();
        Ok(later
            .records
            .into_iter()
            .filter(|r| !known.contains(r.path.as_str()))
            .map(|r| FstatRecord::new(target, r.path, 0, Action::Delete, r.file_type, 0, ""))
            .collect())
    }

    async fn transfer(
        &self,
        entries: Vec<Entry>,
        mode: TransferMode,
    ) -> Result<(Vec<Entry>, Vec<StageReport>)> {
        if entries.is_empty() {
            return Ok((entries, Vec::new()));
        }
        Pipeline::new(self.options)
            .transfer(self.executor.clone(), mode)
            .collect(entries)
            .await
    }
}

fn failed_in(reports: &[StageReport]) -> u64 {
    reports.iter().map(|r| r.failed).sum()
}

fn resolve_prefix(requested: Option<&str>, state: &LocalState) -> Result<String, SyncError> {
    match requested.or(state.prefix()) {
        Some(p) if !p.is_empty() => Ok(p.trim_end_matches('/').to_string()),
        _ => Err(SyncError::Config(format!(
            "{} has never been synced; give a depot prefix",
            state.root().display()
        ))),
    }
}

#[derive(Default)]
struct PhaseTracker {
    entered: Vec<SyncPhase>,
    since: Option<Instant>,
}

impl PhaseTracker {
    fn enter(&mut self, next: SyncPhase) {
        let now = Instant::now();
        match (self.entered.last(), self.since) {
            (Some(prev), Some(since)) => tracing::info!(
                from = %prev,
                to = %next,
                elapsed_ms = now.duration_since(since).as_millis() as u64,
                "phase"
            ),
            _ => tracing::info!(to = %next, "phase"),
        }
        self.entered.push(next);
        self.since = Some(now);
    }

    fn finish(self) -> Vec<SyncPhase> {
        self.entered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::MemoryDepot;
    use crate::record::{Action, FileType};
    use crate::transfer::MirrorTransfer;
    use tempfile::TempDir;

    const PREFIX: &str = "//depot/proj";

    fn setup(temp: &TempDir) -> (Arc<MemoryDepot>, Arc<MirrorTransfer>, Reconciler) {
        let depot = Arc::new(MemoryDepot::new());
        let mirror = Arc::new(MirrorTransfer::new(depot.clone(), PREFIX, temp.path()));
        let reconciler = Reconciler::new(depot.clone(), mirror.clone(), PipelineOptions::default());
        (depot, mirror, reconciler)
    }

    #[tokio::test]
    async fn test_phase_sequence() {
        let temp = TempDir::new().unwrap();
        let (depot, _mirror, reconciler) = setup(&temp);
        depot.submit(PREFIX, 1, "a.txt", Action::Add, FileType::Text, b"a");

        let report = reconciler
            .sync(&SyncRequest::new(temp.path()).prefix(PREFIX))
            .await
            .unwrap();
        assert_eq!(
            report.phases,
            vec![
                SyncPhase::Querying,
                SyncPhase::Filtering,
                SyncPhase::Transferring,
                SyncPhase::Verifying,
                SyncPhase::Transferring,
                SyncPhase::Verifying,
                SyncPhase::Done,
            ]
        );
        assert_eq!(report.to, 1);
        assert_eq!(report.transferred_first, 1);
        assert_eq!(report.transferred_second, 0);
    }

    #[tokio::test]
    async fn test_already_synced_short_circuits() {
        let temp = TempDir::new().unwrap();
        let (depot, mirror, reconciler) = setup(&temp);
        depot.submit(PREFIX, 3, "a.txt", Action::Add, FileType::Text, b"a");
        let request = SyncRequest::new(temp.path()).prefix(PREFIX);

        reconciler.sync(&request).await.unwrap();
        let calls = mirror.invocations();
        let again = reconciler.sync(&request).await.unwrap();
        assert!(again.already_synced);
        assert_eq!(again.final_phase(), Some(SyncPhase::Done));
        assert_eq!(mirror.invocations(), calls);
    }

    #[tokio::test]
    async fn test_prefix_required_for_new_directory() {
        let temp = TempDir::new().unwrap();
        let (_depot, _mirror, reconciler) = setup(&temp);
        let err = reconciler
            .sync(&SyncRequest::new(temp.path()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_state_untouched_on_failure() {
        let temp = TempDir::new().unwrap();
        let (depot, mirror, reconciler) = setup(&temp);
        depot.submit(PREFIX, 7, "x.bin", Action::Add, FileType::Binary, b"payload");
        mirror.inject_failure("x.bin", 2);

        let err = reconciler
            .sync(&SyncRequest::new(temp.path()).prefix(PREFIX))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::VerificationFailed { count: 1, .. })
        ));
        let state = LocalState::open(temp.path()).unwrap();
        assert_eq!(state.changelist(), 0);
        assert!(state.have().is_empty());
    }

    #[tokio::test]
    async fn test_backward_sync_deletes_later_adds() {
        let temp = TempDir::new().unwrap();
        let (depot, _mirror, reconciler) = setup(&temp);
        depot.submit(PREFIX, 1, "a.txt", Action::Add, FileType::Text, b"a");
        depot.submit(PREFIX, 2, "b.txt", Action::Add, FileType::Text, b"b");
        depot.submit(PREFIX, 2, "sub/c.txt", Action::Add, FileType::Text, b"c");
        let request = SyncRequest::new(temp.path()).prefix(PREFIX);

        reconciler.sync(&request.clone().at(2)).await.unwrap();
        assert!(temp.path().join("b.txt").exists());

        let back = reconciler.sync(&request.at(1)).await.unwrap();
        assert_eq!(back.from, 0);
        assert_eq!(back.queried, 3);
        assert_eq!(back.transferred_first, 2);
        assert_eq!(back.transferred_second, 0);
        assert!(temp.path().join("a.txt").exists());
        assert!(!temp.path().join("b.txt").exists());
        assert!(!temp.path().join("sub/c.txt").exists());

        let state = LocalState::open(temp.path()).unwrap();
        assert_eq!(state.changelist(), 1);
        let have: Vec<&String> = state.have().keys().collect();
        assert_eq!(have, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_have_list_follows_deletes() {
        let temp = TempDir::new().unwrap();
        let (depot, _mirror, reconciler) = setup(&temp);
        depot.submit(PREFIX, 1, "a.txt", Action::Add, FileType::Text, b"a");
        depot.submit(PREFIX, 1, "b.txt", Action::Add, FileType::Text, b"b");
        let request = SyncRequest::new(temp.path()).prefix(PREFIX);
        reconciler.sync(&request).await.unwrap();

        depot.submit(PREFIX, 2, "a.txt", Action::Delete, FileType::Text, b"");
        reconciler.sync(&request).await.unwrap();

        assert!(!temp.path().join("a.txt").exists());
        let state = LocalState::open(temp.path()).unwrap();
        assert_eq!(state.changelist(), 2);
        assert_eq!(state.prefix(), Some(PREFIX));
        let have: Vec<&String> = state.have().keys().collect();
        assert_eq!(have, vec!["b.txt"]);
    }
}
