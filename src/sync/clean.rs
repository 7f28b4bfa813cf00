//! `clean`: make a directory hold exactly the depot state.
//!
//! Local files the depot does not have at the changelist are moved into
//! `.depotsync/cleaned/<timestamp>/` (or deleted), then a forced sync
//! re-verifies everything else.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::query::query_range;
use super::{resolve_prefix, Reconciler, SyncReport, SyncRequest};
use crate::state::{LocalState, StateLock, STATE_DIR};

const CLEANED_DIR: &str = "cleaned";

impl Reconciler {
    /// Remove files the depot doesn't know about, then force-sync.
    pub async fn clean(&self, request: &SyncRequest, discard: bool) -> Result<SyncReport> {
        let _lock = StateLock::acquire(&request.root)?;
        let mut state = LocalState::open(&request.root)?;
        let prefix = resolve_prefix(request.prefix.as_deref(), &state)?;
        let target = match request.target {
            Some(t) => t,
            None if state.changelist() > 0 => state.changelist(),
            None => self.head(&prefix).await?,
        };

        let full = query_range(self.depot(), self.service(), &prefix, 0, target).await?;
        let expected: HashSet<String> = full
            .records
            .iter()
            .filter(|r| !r.is_delete())
            .map(|r| self.fold(&r.path))
            .collect();

        let root = request.root.clone();
        let case_insensitive = self.case_insensitive;
        let extra = tokio::task::spawn_blocking(move || find_extra(&root, &expected, case_insensitive))
            .await
            .context("directory walk panicked")??;

        let cleaned = if discard {
            discard_files(&request.root, &extra)?
        } else {
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
            let dest = state.state_dir().join(CLEANED_DIR).join(stamp);
            move_files(&request.root, &dest, &extra)?
        };
        tracing::info!(
            prefix = %prefix,
            changelist = target,
            cleaned,
            discard,
            "removed files not in depot"
        );

        let mut report = self.sync_locked(&mut state, &prefix, target, true).await?;
        report.cleaned = cleaned;
        Ok(report)
    }

    fn fold(&self, path: &str) -> String {
        fold_case(path, self.case_insensitive)
    }
}

fn fold_case(path: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        path.to_lowercase()
    } else {
        path.to_string()
    }
}

/// Files under `root` (relative, `/`-separated) that are not in `expected`.
fn find_extra(root: &Path, expected: &HashSet<String>, case_insensitive: bool) -> Result<Vec<String>> {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .follow_links(false)
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == STATE_DIR))
        .build();

    let mut extra = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 || entry.file_type().is_some_and(|t| t.is_dir()) {
            continue;
        }
        let rel = relative_path(root, entry.path())?;
        if !expected.contains(&fold_case(&rel, case_insensitive)) {
            extra.push(rel);
        }
    }
    extra.sort();
    Ok(extra)
}

fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn local(root: &Path, rel: &str) -> PathBuf {
    rel.split('/').fold(root.to_path_buf(), |p, part| p.join(part))
}

fn move_files(root: &Path, dest: &Path, files: &[String]) -> Result<u64> {
    let mut moved = 0;
    for rel in files {
        let from = local(root, rel);
        let to = local(dest, rel);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)
            .with_context(|| format!("Failed to move {} out of the way", from.display()))?;
        tracing::debug!(path = %rel, "moved to cleaned");
        moved += 1;
    }
    Ok(moved)
}

fn discard_files(root: &Path, files: &[String]) -> Result<u64> {
    let mut removed = 0;
    for rel in files {
        let path = local(root, rel);
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        tracing::debug!(path = %rel, "discarded");
        removed += 1;
    }
    Ok(removed)
}
