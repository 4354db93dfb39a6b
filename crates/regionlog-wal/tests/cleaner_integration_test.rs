//! Retention Integration Tests
//!
//! Segments archived by the roller are later removed by the cleaner.

use std::time::Duration;

use regionlog_core::{Cell, EditBatch};
use regionlog_wal::segment::list_segments;
use regionlog_wal::{LogCleaner, RetentionConfig, SyncPolicy, Wal, WalConfig};
use tempfile::TempDir;

#[tokio::test]
async fn test_archived_segments_cleaned() {
    let dir = TempDir::new().unwrap();
    let config = WalConfig {
        sync_policy: SyncPolicy::Never,
        archive_use_subdir: true,
        ..WalConfig::with_base_dir(dir.path())
    };
    let wal = Wal::open(config.clone()).await.unwrap();

    for i in 0..5u64 {
        let edits: EditBatch = vec![Cell::put("row", "cf", "q", i, "v")].into();
        wal.append("region", "t", &edits, i).await.unwrap();
        let seq = wal.start_flush(b"region");
        wal.complete_flush(b"region", seq);
        wal.roll().await.unwrap();
    }
    let archived = list_segments(&wal.archive_dir(), None).await.unwrap();
    assert_eq!(archived.len(), 5);

    // A stray file the archive should not hold
    std::fs::write(config.archive_dir.join("stray.txt"), b"junk").unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cleaner = LogCleaner::from_config(
        &config.archive_dir,
        RetentionConfig {
            ttl_ms: 10,
            max_deletions_per_run: 4,
            ..Default::default()
        },
    );
    assert_eq!(cleaner.delegate_name(), "ttl");

    let first = cleaner.run_once().await.unwrap();
    assert_eq!(first.deleted, 4);
    let second = cleaner.run_once().await.unwrap();
    assert_eq!(second.deleted, 2);
    let third = cleaner.run_once().await.unwrap();
    assert_eq!(third.deleted, 0);

    assert!(list_segments(&wal.archive_dir(), None).await.unwrap().is_empty());
    assert!(!config.archive_dir.join("stray.txt").exists());
}

#[tokio::test]
async fn test_unflushed_segments_never_reach_cleaner() {
    let dir = TempDir::new().unwrap();
    let config = WalConfig::with_base_dir(dir.path());
    let wal = Wal::open(config.clone()).await.unwrap();

    let edits: EditBatch = vec![Cell::put("row", "cf", "q", 1, "v")].into();
    wal.append("region", "t", &edits, 1).await.unwrap();
    wal.roll().await.unwrap();

    let cleaner = LogCleaner::from_config(
        &config.archive_dir,
        RetentionConfig {
            ttl_ms: 0,
            ..Default::default()
        },
    );
    assert_eq!(cleaner.run_once().await.unwrap().deleted, 0);
    assert_eq!(wal.num_active_segments().await, 1);
}
