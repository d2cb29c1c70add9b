pub mod backup_engine;
pub mod binlog;
pub mod binlog_sync;
pub mod layout;
pub mod parser;
pub mod process;
pub mod replay;
pub mod server;
pub mod singleflight;

pub use backup_engine::*;
pub use binlog::*;
pub use binlog_sync::*;
pub use layout::*;
pub use parser::*;
pub use replay::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One backup run as recorded by the caller. The engines read it to locate
/// files on disk; persisting it is the caller's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbBackupHistory {
    pub db_instance_id: u64,
    pub db_backup_id: u64,
    pub db_name: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecoveryError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("server query failed: {message}")]
    ServerQuery { message: String },

    #[error("{program} failed: {stderr}")]
    Tool { program: String, stderr: String },

    #[error("filesystem error: {message}")]
    FileSystem { message: String },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("downloaded binlog file {name} is {actual} bytes but the server reported {expected}")]
    SizeMismatch {
        name: String,
        expected: i64,
        actual: i64,
    },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("operation cancelled: {message}")]
    Cancelled { message: String },
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Removes the wrapped path on drop. A missing file is ignored, so the guard
/// is harmless once the file has been renamed into place.
pub(crate) struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_file_guard_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.tmp");
        std::fs::write(&path, b"partial").unwrap();
        {
            let _guard = TempFileGuard::new(path.clone());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_temp_file_guard_ignores_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = TempFileGuard::new(dir.path().join("never-created"));
    }
}
