// Per-directory sync state
//
// Records the last changelist a tracked directory was verified at, and the
// have-list of paths confirmed present. Stored as text in <root>/.depotsync/

use crate::error::{Result, SyncError};
use crate::record::FstatRecord;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Name of the state directory inside a tracked directory
pub const STATE_DIR: &str = ".depotsync";

const STATE_FILE: &str = "state.lst";
const LOCK_FILE: &str = "lock";

/// A path confirmed present at a changelist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaveEntry {
    pub change: u64,
    pub digest: String,
}

pub type HaveList = HashMap<String, HaveEntry>;

/// Persistent state of one tracked directory (text-based)
#[derive(Debug)]
pub struct LocalState {
    root: PathBuf,
    state_file: PathBuf,
    prefix: Option<String>,
    changelist: u64,
    have: HaveList,
}

impl LocalState {
    /// Format version
    const FORMAT_VERSION: &'static str = "v1";

    /// Open the state of `root`, or start empty if it was never synced.
    pub fn open(root: &Path) -> Result<Self> {
        let state_file = root.join(STATE_DIR).join(STATE_FILE);

        let mut state = Self {
            root: root.to_path_buf(),
            state_file,
            prefix: None,
            changelist: 0,
            have: HashMap::new(),
        };
        if state.state_file.exists() {
            state.load_from_file()?;
        }
        Ok(state)
    }

    /// Load state from file. Any line that does not parse fails the load.
    fn load_from_file(&mut self) -> Result<()> {
        let file = fs::File::open(&self.state_file)?;
        let reader = BufReader::new(file);

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = index as u64 + 1;

            if let Some(header) = line.strip_prefix("# ") {
                if let Some(prefix) = header.strip_prefix("prefix: ") {
                    self.prefix = Some(prefix.to_string());
                } else if let Some(cl) = header.strip_prefix("changelist: ") {
                    self.changelist = cl.trim().parse().map_err(|_| {
                        self.corrupt(line_no, format!("invalid changelist {:?}", cl))
                    })?;
                }
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            // Parse: <change> <digest|-> <path>
            let parts: Vec<&str> = line.splitn(3, ' ').collect();
            if parts.len() != 3 || parts[2].is_empty() {
                return Err(self.corrupt(line_no, "expected <change> <digest> <path>"));
            }
            let change: u64 = parts[0]
                .parse()
                .map_err(|_| self.corrupt(line_no, format!("invalid change {:?}", parts[0])))?;
            let digest = if parts[1] == "-" {
                String::new()
            } else {
                parts[1].to_string()
            };

            self.have.insert(parts[2].to_string(), HaveEntry { change, digest });
        }

        Ok(())
    }

    fn corrupt(&self, line: u64, reason: impl Into<String>) -> SyncError {
        SyncError::CorruptState {
            path: self.state_file.clone(),
            line,
            reason: reason.into(),
        }
    }

    /// Save all state to file (atomic write)
    pub fn save(&self) -> Result<()> {
        let dir = self.root.join(STATE_DIR);
        fs::create_dir_all(&dir)?;
        let temp_file = self.state_file.with_extension("tmp");

        {
            let mut file = fs::File::create(&temp_file)?;

            writeln!(file, "# depotsync state {}", Self::FORMAT_VERSION)?;
            if let Some(prefix) = &self.prefix {
                writeln!(file, "# prefix: {}", prefix)?;
            }
            writeln!(file, "# changelist: {}", self.changelist)?;
            let now = chrono::Utc::now();
            writeln!(file, "# last_sync: {}", now.to_rfc3339())?;

            // Sorted for deterministic output
            let mut entries: Vec<(&String, &HaveEntry)> = self.have.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            for (path, have) in entries {
                let digest = if have.digest.is_empty() {
                    "-"
                } else {
                    have.digest.as_str()
                };
                writeln!(file, "{} {} {}", have.change, digest, path)?;
            }
            file.sync_all()?;
        }

        // Atomic rename
        fs::rename(&temp_file, &self.state_file)?;

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Last changelist this directory was fully verified at (0 = never)
    pub fn changelist(&self) -> u64 {
        self.changelist
    }

    pub fn set_changelist(&mut self, changelist: u64) {
        self.changelist = changelist;
    }

    /// Depot prefix this directory tracks, once known
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) -> Result<()> {
        let prefix = prefix.into();
        if prefix.contains('\n') {
            return Err(SyncError::Config(format!("invalid prefix {:?}", prefix)));
        }
        self.prefix = Some(prefix);
        Ok(())
    }

    pub fn have(&self) -> &HaveList {
        &self.have
    }

    /// Mark verified records in the have-list. Deletes leave it.
    pub fn record_synced<'a>(&mut self, records: impl IntoIterator<Item = &'a FstatRecord>) {
        for record in records {
            if record.is_delete() {
                self.have.remove(&record.path);
            } else {
                self.have.insert(
                    record.path.clone(),
                    HaveEntry {
                        change: record.change,
                        digest: record.digest.clone(),
                    },
                );
            }
        }
    }

    /// Forget everything (used before a full re-verification)
    pub fn clear_have(&mut self) {
        self.have.clear();
    }
}

/// Exclusive advisory lock on a tracked directory, held for a whole run.
pub struct StateLock {
    file: fs::File,
}

impl StateLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        let dir = root.join(STATE_DIR);
        fs::create_dir_all(&dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        file.try_lock_exclusive().map_err(|_| {
            SyncError::Config(format!(
                "{} is being synced by another process",
                root.display()
            ))
        })?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
