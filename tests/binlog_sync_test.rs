//! Fetch coalescing and windowing through the public syncer surface, against
//! scripted connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_test::traced_test;
use mysql_pitr::{
    BinlogSyncer, DbConnection, DbInfo, DbType, QueryOutput, QueryValue, RecoveryConfig,
    RecoveryError,
};

/// Counts queries and answers every one with the same catalog after a short
/// delay, long enough for concurrent callers to pile onto one flight.
struct CountingConnection {
    queries: AtomicUsize,
    output: QueryOutput,
}

#[async_trait]
impl DbConnection for CountingConnection {
    async fn query(&self, _sql: &str) -> anyhow::Result<QueryOutput> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.output.clone())
    }
}

fn info(instance_id: u64) -> DbInfo {
    DbInfo {
        host: "127.0.0.1".to_string(),
        port: 3306,
        username: "root".to_string(),
        password: String::new(),
        instance_id,
        db_type: DbType::MySql,
    }
}

fn syncer(instance_id: u64, conn: Arc<dyn DbConnection>) -> (BinlogSyncer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = RecoveryConfig {
        backup_path: dir.path().to_path_buf(),
        ..RecoveryConfig::default()
    };
    (
        BinlogSyncer::new(info(instance_id), conn, Arc::new(config)),
        dir,
    )
}

fn catalog_row(name: &str, size: u64) -> HashMap<String, QueryValue> {
    HashMap::from([
        ("Log_name".to_string(), QueryValue::Text(name.to_string())),
        ("File_size".to_string(), QueryValue::Unsigned(size)),
    ])
}

fn empty_catalog() -> QueryOutput {
    QueryOutput {
        columns: vec!["Log_name".to_string(), "File_size".to_string()],
        rows: Vec::new(),
    }
}

#[tokio::test]
#[traced_test]
async fn test_concurrent_fetches_share_one_cycle() {
    let conn = Arc::new(CountingConnection {
        queries: AtomicUsize::new(0),
        output: empty_catalog(),
    });
    let (syncer, _dir) = syncer(901, conn.clone());

    let (a, b, c) = tokio::join!(
        syncer.fetch_binlogs(false, 1, -1),
        syncer.fetch_binlogs(false, 1, -1),
        syncer.fetch_binlogs(false, 1, -1),
    );
    assert!(a.unwrap().is_empty());
    assert!(b.unwrap().is_empty());
    assert!(c.unwrap().is_empty());
    assert_eq!(conn.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sequential_fetches_run_fresh_cycles() {
    let conn = Arc::new(CountingConnection {
        queries: AtomicUsize::new(0),
        output: empty_catalog(),
    });
    let (syncer, _dir) = syncer(902, conn.clone());

    syncer.fetch_binlogs(false, 1, -1).await.unwrap();
    syncer.fetch_binlogs(false, 1, -1).await.unwrap();
    assert_eq!(conn.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[traced_test]
async fn test_coalesced_errors_reach_every_caller() {
    // A catalog that contains neither anchor sequence.
    let conn = Arc::new(CountingConnection {
        queries: AtomicUsize::new(0),
        output: QueryOutput {
            columns: vec!["Log_name".to_string(), "File_size".to_string()],
            rows: vec![
                catalog_row("binlog.000001", 100),
                catalog_row("binlog.000002", 100),
            ],
        },
    });
    let (syncer, _dir) = syncer(903, conn.clone());

    let (a, b) = tokio::join!(
        syncer.fetch_binlogs(false, 9, 7),
        syncer.fetch_binlogs(false, 9, 7),
    );
    assert!(matches!(a, Err(RecoveryError::NotFound { .. })));
    assert!(matches!(b, Err(RecoveryError::NotFound { .. })));
    assert_eq!(conn.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_local_scan_of_an_unused_instance_is_empty() {
    let conn = Arc::new(CountingConnection {
        queries: AtomicUsize::new(0),
        output: QueryOutput::default(),
    });
    let (syncer, _dir) = syncer(904, conn);
    let files = syncer.local_binlog_files().await.unwrap();
    assert!(files.is_empty());
}

#[tokio::test]
async fn test_local_scan_skips_temp_files_and_sorts_numerically() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecoveryConfig {
        backup_path: dir.path().to_path_buf(),
        ..RecoveryConfig::default()
    };
    let binlog_dir = dir.path().join("instance-905").join("binlog");
    std::fs::create_dir_all(&binlog_dir).unwrap();
    std::fs::write(binlog_dir.join("binlog.1000000"), b"x").unwrap();
    std::fs::write(binlog_dir.join("binlog.999999"), b"xy").unwrap();
    std::fs::write(binlog_dir.join("tmp-binlog.1000001"), b"partial").unwrap();
    std::fs::write(binlog_dir.join("notes.txt.old"), b"ignored").unwrap();

    let conn = Arc::new(CountingConnection {
        queries: AtomicUsize::new(0),
        output: QueryOutput::default(),
    });
    let syncer = BinlogSyncer::new(info(905), conn, Arc::new(config));
    let files = syncer.local_binlog_files().await.unwrap();
    let names: Vec<&str> = files.iter().map(|file| file.name.as_str()).collect();
    assert_eq!(names, vec!["binlog.999999", "binlog.1000000"]);
    assert!(files.iter().all(|file| file.downloaded));
    assert_eq!(files[0].size, 2);
}
