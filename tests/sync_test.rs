use std::fs;
use std::sync::Arc;

use depotsync::depot::MemoryDepot;
use depotsync::filter::DropChecksum;
use depotsync::state::LocalState;
use depotsync::streaming::{Entry, Pipeline, PipelineOptions};
use depotsync::sync::{Reconciler, SyncPhase, SyncRequest};
use depotsync::transfer::MirrorTransfer;
use depotsync::{Action, FileType, SyncError};
use tempfile::TempDir;

const PREFIX: &str = "//depot/main";

struct Fixture {
    temp: TempDir,
    depot: Arc<MemoryDepot>,
    mirror: Arc<MirrorTransfer>,
    reconciler: Reconciler,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let depot = Arc::new(MemoryDepot::new());
        let mirror = Arc::new(MirrorTransfer::new(depot.clone(), PREFIX, temp.path()));
        let options = PipelineOptions {
            channel_capacity: 8,
            batch_bytes: 64,
            workers: 3,
        };
        let reconciler = Reconciler::new(depot.clone(), mirror.clone(), options);
        Self {
            temp,
            depot,
            mirror,
            reconciler,
        }
    }

    fn request(&self) -> SyncRequest {
        SyncRequest::new(self.temp.path()).prefix(PREFIX)
    }

    fn read(&self, path: &str) -> Vec<u8> {
        fs::read(self.temp.path().join(path)).unwrap()
    }
}

#[tokio::test]
async fn test_scenario_a_only_mismatched_file_is_transferred() -> anyhow::Result<()> {
    let fx = Fixture::new();
    let d1 = fx.depot.submit(PREFIX, 10, "d1.txt", Action::Add, FileType::Text, b"one");
    let d2 = fx.depot.submit(PREFIX, 10, "d2.txt", Action::Add, FileType::Text, b"two");
    let d3 = fx.depot.submit(PREFIX, 10, "d3.txt", Action::Add, FileType::Text, b"three");

    fs::write(fx.temp.path().join("d1.txt"), "one")?;
    fs::write(fx.temp.path().join("d2.txt"), "stale")?;
    fs::write(fx.temp.path().join("d3.txt"), "three")?;

    // drop --checksum alone forwards only d2
    let (forwarded, _) = Pipeline::new(PipelineOptions::default())
        .filter(DropChecksum::new(fx.temp.path()))
        .collect(vec![Entry::new(d1), Entry::new(d2.clone()), Entry::new(d3)])
        .await?;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].record, d2);

    let report = fx.reconciler.sync(&fx.request()).await?;
    assert_eq!(report.queried, 3);
    assert_eq!(report.dropped_pre, 2);
    assert_eq!(report.transferred_first, 1);
    assert_eq!(report.transferred_second, 0);
    assert_eq!(report.final_phase(), Some(SyncPhase::Done));
    assert_eq!(fx.read("d2.txt"), b"two");
    assert_eq!(LocalState::open(fx.temp.path())?.changelist(), 10);
    Ok(())
}

#[tokio::test]
async fn test_scenario_b_persistent_failure_names_path() {
    let fx = Fixture::new();
    fx.depot.submit(PREFIX, 4, "ok.txt", Action::Add, FileType::Text, b"fine");
    let x = fx.depot.submit(PREFIX, 5, "X", Action::Add, FileType::Binary, b"\x00\x01");
    fx.mirror.inject_failure("X", 2);

    let err = fx.reconciler.sync(&fx.request()).await.unwrap_err();
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::VerificationFailed { count, paths }) => {
            assert_eq!(*count, 1);
            assert_eq!(paths, &vec![x.spec()]);
        }
        other => panic!("expected a verification failure, got {:?}", other),
    }
    assert!(err.to_string().contains("X#1"));

    // The good file landed, but the state did not move.
    assert_eq!(fx.read("ok.txt"), b"fine");
    assert_eq!(LocalState::open(fx.temp.path()).unwrap().changelist(), 0);
}

#[tokio::test]
async fn test_transient_failure_recovers_in_forced_round() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.depot.submit(PREFIX, 1, "flaky.bin", Action::Add, FileType::Binary, b"data");
    fx.depot.submit(PREFIX, 1, "bent.txt", Action::Add, FileType::Text, b"straight");
    fx.mirror.inject_failure("flaky.bin", 1);
    fx.mirror.inject_corruption("bent.txt", 1);

    let report = fx.reconciler.sync(&fx.request()).await?;
    assert_eq!(report.transferred_first, 2);
    assert_eq!(report.transferred_second, 2);
    assert_eq!(report.failed_transfers, 1);
    assert_eq!(fx.read("flaky.bin"), b"data");
    assert_eq!(fx.read("bent.txt"), b"straight");
    Ok(())
}

#[tokio::test]
async fn test_second_sync_transfers_nothing() -> anyhow::Result<()> {
    let fx = Fixture::new();
    for i in 0..20 {
        let content = format!("file number {}", i);
        fx.depot.submit(
            PREFIX,
            1 + i % 3,
            &format!("dir{}/f{}.txt", i % 4, i),
            Action::Add,
            FileType::Text,
            content.as_bytes(),
        );
    }

    let first = fx.reconciler.sync(&fx.request()).await?;
    assert_eq!(first.transferred_first, 20);
    let transferred = fx.mirror.transferred();

    let again = fx.reconciler.sync(&fx.request().force(true)).await?;
    assert_eq!(again.queried, 20);
    assert_eq!(again.dropped_pre, 20);
    assert_eq!(again.transferred_first, 0);
    assert_eq!(fx.mirror.transferred(), transferred);
    Ok(())
}

#[tokio::test]
async fn test_incremental_sync_and_rollback() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.depot.submit(PREFIX, 1, "a.txt", Action::Add, FileType::Text, b"v1");
    fx.depot.submit(PREFIX, 1, "b.txt", Action::Add, FileType::Text, b"b");
    fx.depot.submit(PREFIX, 2, "a.txt", Action::Edit, FileType::Text, b"v2");
    fx.depot.submit(PREFIX, 3, "b.txt", Action::Delete, FileType::Text, b"");
    fx.depot.submit(PREFIX, 3, "new/c.txt", Action::Add, FileType::Text, b"c");

    fx.reconciler.sync(&fx.request().at(1)).await?;
    assert_eq!(fx.read("a.txt"), b"v1");

    let forward = fx.reconciler.sync(&fx.request()).await?;
    assert_eq!((forward.from, forward.to), (1, 3));
    assert_eq!(fx.read("a.txt"), b"v2");
    assert_eq!(fx.read("new/c.txt"), b"c");
    assert!(!fx.temp.path().join("b.txt").exists());

    let back = fx.reconciler.sync(&fx.request().at(1)).await?;
    assert_eq!(back.from, 0);
    assert_eq!(fx.read("a.txt"), b"v1");
    assert_eq!(fx.read("b.txt"), b"b");
    assert!(!fx.temp.path().join("new/c.txt").exists());
    assert_eq!(LocalState::open(fx.temp.path())?.changelist(), 1);
    Ok(())
}

#[tokio::test]
async fn test_delete_under_path_that_became_a_file() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.depot.submit(PREFIX, 1, "a/b", Action::Add, FileType::Text, b"inner");
    fx.depot.submit(PREFIX, 2, "a/b", Action::Delete, FileType::Text, b"");
    fx.depot.submit(PREFIX, 3, "a", Action::Add, FileType::Text, b"outer");

    fx.reconciler.sync(&fx.request().at(1)).await?;
    assert_eq!(fx.read("a/b"), b"inner");

    // The mirror leaves empty directories behind.
    fx.reconciler.sync(&fx.request().at(2)).await?;
    fs::remove_dir(fx.temp.path().join("a"))?;

    let report = fx.reconciler.sync(&fx.request().at(3).force(true)).await?;
    assert_eq!(report.final_phase(), Some(SyncPhase::Done));
    assert_eq!(fx.read("a"), b"outer");

    // `a/b` is now a path under a file; its delete counts as applied.
    let again = fx.reconciler.sync(&fx.request().force(true)).await?;
    assert_eq!(again.queried, 2);
    assert_eq!(again.transferred_first, 0);
    Ok(())
}

#[tokio::test]
async fn test_utf16_and_symlink_records_converge() -> anyhow::Result<()> {
    let fx = Fixture::new();
    let utf16: Vec<u8> = [0xFF, 0xFE]
        .into_iter()
        .chain("héllo".encode_utf16().flat_map(|u| u.to_le_bytes()))
        .collect();
    fx.depot.submit(PREFIX, 1, "wide.txt", Action::Add, FileType::Utf16, &utf16);
    if cfg!(unix) {
        fx.depot.submit(PREFIX, 1, "link", Action::Add, FileType::Symlink, b"wide.txt");
    }

    let report = fx.reconciler.sync(&fx.request()).await?;
    assert_eq!(report.transferred_second, 0);
    assert_eq!(fx.read("wide.txt"), utf16);
    Ok(())
}
