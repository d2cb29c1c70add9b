//! The backup-to-replay contract exercised without a live server: dump
//! header coordinates feed a replay plan whose paths follow the on-disk
//! layout.

use std::path::PathBuf;

use mysql_pitr::recovery::read_binlog_info;
use mysql_pitr::{BackupLayout, BinlogFile, RestoreInfo};

fn downloaded(sequence: i64) -> BinlogFile {
    BinlogFile {
        name: format!("binlog.{sequence:06}"),
        sequence,
        size: 4096,
        first_event_time: None,
        downloaded: true,
    }
}

#[tokio::test]
async fn test_dump_coordinates_anchor_a_replay_plan() {
    let dump = "\
-- MySQL dump 10.13  Distrib 8.0.28, for Linux (x86_64)\n\
--\n\
-- Host: 127.0.0.1    Database: shop\n\
--\n\
-- Position to start replication or point-in-time recovery from\n\
--\n\
-- CHANGE MASTER TO MASTER_LOG_FILE='binlog.000042', MASTER_LOG_POS=3571;\n";
    let start = read_binlog_info(dump.as_bytes()).await.unwrap();
    assert_eq!(start.file_name, "binlog.000042");
    assert_eq!(start.sequence, 42);
    assert_eq!(start.position, 3571);

    let files = vec![downloaded(42), downloaded(43), downloaded(44)];
    let plan = RestoreInfo::new(&start, 44, 9000, &files).unwrap();
    assert_eq!(plan.start_position, 3571);
    assert_eq!(plan.target_position, 9000);

    let layout = BackupLayout::new("/backups");
    let paths = plan.binlog_paths(&layout.binlog_dir(7));
    assert_eq!(
        paths,
        vec![
            PathBuf::from("/backups/instance-7/binlog/binlog.000042"),
            PathBuf::from("/backups/instance-7/binlog/binlog.000043"),
            PathBuf::from("/backups/instance-7/binlog/binlog.000044"),
        ]
    );
}

#[tokio::test]
async fn test_a_plan_over_an_incomplete_mirror_is_refused() {
    let dump = "\
-- Position to start replication or point-in-time recovery from\n\
-- CHANGE MASTER TO MASTER_LOG_FILE='binlog.000042', MASTER_LOG_POS=3571;\n";
    let start = read_binlog_info(dump.as_bytes()).await.unwrap();

    // The file after the backup anchor never got mirrored.
    let files = vec![downloaded(42), downloaded(44)];
    assert!(RestoreInfo::new(&start, 44, 9000, &files).is_err());
}

#[test]
fn test_backup_and_binlog_dirs_share_the_instance_root() {
    let layout = BackupLayout::new("/backups");
    let root = layout.instance_root(3);
    assert!(layout.binlog_dir(3).starts_with(&root));
    assert!(layout.backup_dir(3, 9).starts_with(&root));
    assert_eq!(
        layout.backup_dir(3, 9).join("a0b1.sql"),
        PathBuf::from("/backups/instance-3/backup-9/a0b1.sql")
    );
}
