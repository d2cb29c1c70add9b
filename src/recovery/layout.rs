use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk layout of everything the engines write, rooted at the configured
/// backup path. Restores read files written by past backups, so the derived
/// paths are a stable contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupLayout {
    backup_path: PathBuf,
}

impl BackupLayout {
    pub fn new(backup_path: impl Into<PathBuf>) -> Self {
        Self {
            backup_path: backup_path.into(),
        }
    }

    /// `<backup_path>/instance-<id>`
    pub fn instance_root(&self, instance_id: u64) -> PathBuf {
        self.backup_path.join(format!("instance-{instance_id}"))
    }

    /// `<backup_path>/instance-<id>/binlog`
    pub fn binlog_dir(&self, instance_id: u64) -> PathBuf {
        self.instance_root(instance_id).join("binlog")
    }

    /// `<backup_path>/instance-<id>/backup-<backup_id>`
    pub fn backup_dir(&self, instance_id: u64, backup_id: u64) -> PathBuf {
        self.instance_root(instance_id)
            .join(format!("backup-{backup_id}"))
    }

    pub fn binlog_file_path(&self, instance_id: u64, file_name: &str) -> PathBuf {
        self.binlog_dir(instance_id).join(file_name)
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }
}
