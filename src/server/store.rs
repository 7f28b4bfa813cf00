//! Write-once store of cumulative fstat state.
//!
//! An entry is the state of one prefix at one changelist: the latest record of
//! every path changed at or before that changelist. Changelists never change
//! once submitted, so an entry is valid forever. Entries are inserted with a
//! no-clobber rename and never rewritten; they are only removed by `prune`.
//!
//! Layout: `<root>/<hex(prefix)>/<changelist, 20 digits>.fstat.zst`

use crate::depot::{latest_per_path, Depot};
use crate::error::SyncError;
use crate::record::{FstatRecord, COLUMNS_HEADER};
use crate::streaming::codec::{decode_all, encode_all};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const ENTRY_SUFFIX: &str = ".fstat.zst";
const ZSTD_LEVEL: i32 = 3;

/// What the store can say about a range query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Full(Vec<FstatRecord>),
    Redirect {
        redirect_to: u64,
        records: Vec<FstatRecord>,
    },
    Miss,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache store {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn prefix_dir(&self, prefix: &str) -> PathBuf {
        self.root.join(hex::encode(prefix.as_bytes()))
    }

    fn entry_path(&self, prefix: &str, changelist: u64) -> PathBuf {
        self.prefix_dir(prefix)
            .join(format!("{:020}{}", changelist, ENTRY_SUFFIX))
    }

    /// Cached changelists for `prefix`, newest first.
    pub fn changelists(&self, prefix: &str) -> Result<Vec<u64>> {
        let dir = self.prefix_dir(prefix);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(cl) = name
                .strip_suffix(ENTRY_SUFFIX)
                .and_then(|n| n.parse::<u64>().ok())
            {
                out.push(cl);
            }
        }
        out.sort_unstable_by(|a, b| b.cmp(a));
        Ok(out)
    }

    pub fn contains(&self, prefix: &str, changelist: u64) -> bool {
        self.entry_path(prefix, changelist).is_file()
    }

    /// Full state of `prefix` at `changelist`, if cached.
    pub fn get(&self, prefix: &str, changelist: u64) -> Result<Option<Vec<FstatRecord>>> {
        let path = self.entry_path(prefix, changelist);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut decoder = zstd::stream::read::Decoder::new(file)?;
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .with_context(|| format!("Failed to read cache entry {}", path.display()))?;
        Ok(Some(decode_all(&text)?))
    }

    /// Store the state of `prefix` at `changelist`. Returns `false` if an
    /// entry was already there; existing entries are never replaced.
    pub fn insert(&self, prefix: &str, changelist: u64, records: &[FstatRecord]) -> Result<bool> {
        if prefix.contains(&['\n', '\r'][..]) {
            return Err(SyncError::Protocol(format!("invalid prefix {:?}", prefix)).into());
        }
        let dir = self.prefix_dir(prefix);
        fs::create_dir_all(&dir)?;
        let target = self.entry_path(prefix, changelist);
        if target.exists() {
            return Ok(false);
        }

        let header = format!("{}\n# prefix: {}\n# changelist: {}", COLUMNS_HEADER, prefix, changelist);
        let text = encode_all(records, Some(&header))?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        {
            let mut encoder = zstd::stream::write::Encoder::new(temp.as_file_mut(), ZSTD_LEVEL)?;
            encoder.write_all(text.as_bytes())?;
            encoder.finish()?;
        }
        temp.as_file().sync_all()?;

        match temp.persist_noclobber(&target) {
            Ok(_) => {
                tracing::debug!(prefix, changelist, records = records.len(), "cache entry stored");
                Ok(true)
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    /// Answer `(from, to]` for `prefix`.
    ///
    /// Full when `to` itself is cached. Otherwise redirect to the highest
    /// cached changelist strictly inside the range, or miss.
    pub fn lookup(&self, prefix: &str, from: u64, to: u64) -> Result<Lookup> {
        if from >= to {
            return Err(SyncError::Protocol(format!("empty range ({}, {}]", from, to)).into());
        }
        if let Some(state) = self.get(prefix, to)? {
            return Ok(Lookup::Full(latest_per_path(state, from, to)));
        }

        let Some(redirect_to) = self
            .changelists(prefix)?
            .into_iter()
            .find(|&cl| from < cl && cl < to)
        else {
            return Ok(Lookup::Miss);
        };
        match self.get(prefix, redirect_to)? {
            Some(state) => Ok(Lookup::Redirect {
                redirect_to,
                records: latest_per_path(state, from, redirect_to),
            }),
            // Pruned between listing and reading.
            None => Ok(Lookup::Miss),
        }
    }

    /// Build and store the state at `changelist` from the nearest lower entry
    /// plus a depot query for the gap. Returns `false` if already cached.
    pub async fn ingest(&self, depot: &dyn Depot, prefix: &str, changelist: u64) -> Result<bool> {
        if self.contains(prefix, changelist) {
            return Ok(false);
        }

        let base = self
            .changelists(prefix)?
            .into_iter()
            .find(|&cl| cl < changelist);
        let mut state: HashMap<String, FstatRecord> = HashMap::new();
        let base_cl = match base {
            Some(cl) => {
                for record in self.get(prefix, cl)?.unwrap_or_default() {
                    state.insert(record.path.clone(), record);
                }
                cl
            }
            None => 0,
        };

        let delta = depot
            .fstat(prefix, base_cl, changelist)
            .await
            .with_context(|| format!("Failed to query depot for ({}, {}]", base_cl, changelist))?;
        tracing::info!(
            prefix,
            base = base_cl,
            changelist,
            delta = delta.len(),
            "ingesting"
        );
        for record in delta {
            state.insert(record.path.clone(), record);
        }

        let mut records: Vec<FstatRecord> = state.into_values().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        self.insert(prefix, changelist, &records)
    }

    /// Evict entries until at most `keep` remain. The newest and oldest
    /// entries are kept; every other entry in between goes first.
    pub fn prune(&self, prefix: &str, keep: usize) -> Result<usize> {
        let mut cls = self.changelists(prefix)?;
        cls.reverse();
        let keep = keep.max(2);
        let mut removed = 0;

        while cls.len() > keep {
            let mut i = 1;
            while i < cls.len() - 1 && cls.len() > keep {
                let cl = cls.remove(i);
                match fs::remove_file(self.entry_path(prefix, cl)) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                i += 1;
            }
        }
        if removed > 0 {
            tracing::info!(prefix, removed, remaining = cls.len(), "pruned cache");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::MemoryDepot;
    use crate::record::{Action, FileType};
    use proptest::prelude::*;
    use tempfile::TempDir;

    const PREFIX: &str = "//depot/proj";

    fn depot_with_changes(n: u64) -> MemoryDepot {
        let depot = MemoryDepot::new();
        for change in 1..=n {
            let path = format!("f{}.txt", change % 7);
            depot.submit(PREFIX, change, &path, Action::Edit, FileType::Text, path.as_bytes());
        }
        depot
    }

    #[tokio::test]
    async fn test_full_hit() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        let depot = depot_with_changes(20);
        assert!(store.ingest(&depot, PREFIX, 20).await.unwrap());

        let direct = depot.fstat(PREFIX, 5, 20).await.unwrap();
        assert_eq!(store.lookup(PREFIX, 5, 20).unwrap(), Lookup::Full(direct));
    }

    #[tokio::test]
    async fn test_redirect_to_highest_inside_range() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        let depot = depot_with_changes(30);
        for cl in [10, 15, 25] {
            store.ingest(&depot, PREFIX, cl).await.unwrap();
        }

        match store.lookup(PREFIX, 12, 20).unwrap() {
            Lookup::Redirect {
                redirect_to,
                records,
            } => {
                assert_eq!(redirect_to, 15);
                assert_eq!(records, depot.fstat(PREFIX, 12, 15).await.unwrap());
            }
            other => panic!("expected redirect, got {:?}", other),
        }
        assert_eq!(store.lookup(PREFIX, 15, 20).unwrap(), Lookup::Miss);
        assert_eq!(store.lookup(PREFIX, 26, 30).unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_insert_is_write_once() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        let depot = depot_with_changes(10);
        assert!(store.ingest(&depot, PREFIX, 10).await.unwrap());
        let first = store.get(PREFIX, 10).unwrap().unwrap();

        assert!(!store.insert(PREFIX, 10, &[]).unwrap());
        assert!(!store.ingest(&depot, PREFIX, 10).await.unwrap());
        assert_eq!(store.get(PREFIX, 10).unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_ingest_builds_on_lower_entry() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        let depot = depot_with_changes(40);
        store.ingest(&depot, PREFIX, 20).await.unwrap();
        store.ingest(&depot, PREFIX, 40).await.unwrap();

        let cumulative = store.get(PREFIX, 40).unwrap().unwrap();
        assert_eq!(cumulative, depot.fstat(PREFIX, 0, 40).await.unwrap());
        assert_eq!(store.changelists(PREFIX).unwrap(), vec![40, 20]);
    }

    #[test]
    fn test_empty_range_rejected() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        assert!(store.lookup(PREFIX, 10, 10).is_err());
    }

    #[test]
    fn test_prune_keeps_ends() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        for cl in 1..=9 {
            store.insert(PREFIX, cl * 10, &[]).unwrap();
        }

        let removed = store.prune(PREFIX, 4).unwrap();
        assert_eq!(removed, 5);
        let left = store.changelists(PREFIX).unwrap();
        assert_eq!(left.len(), 4);
        assert_eq!(left.first(), Some(&90));
        assert_eq!(left.last(), Some(&10));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_redirect_monotonic(
            cached in proptest::collection::btree_set(1u64..200, 0..10),
            from in 0u64..200,
            span in 1u64..100,
        ) {
            let temp = TempDir::new().unwrap();
            let store = CacheStore::open(temp.path()).unwrap();
            for cl in &cached {
                store.insert(PREFIX, *cl, &[]).unwrap();
            }
            let to = from + span;
            match store.lookup(PREFIX, from, to).unwrap() {
                Lookup::Redirect { redirect_to, .. } => {
                    prop_assert!(from < redirect_to && redirect_to < to);
                    prop_assert!(!cached.contains(&to));
                }
                Lookup::Full(_) => prop_assert!(cached.contains(&to)),
                Lookup::Miss => {
                    prop_assert!(!cached.contains(&to));
                    prop_assert!(!cached.iter().any(|&cl| from < cl && cl < to));
                }
            }
        }
    }
}
