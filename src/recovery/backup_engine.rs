use std::sync::Arc;

use tokio::fs;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::binlog::BinlogInfo;
use super::layout::BackupLayout;
use super::parser::read_binlog_info;
use super::process::run_tool;
use super::{DbBackupHistory, RecoveryError, Result, TempFileGuard};
use crate::config::RecoveryConfig;
use crate::connection::DbInfo;

/// Produces logical full-database backups anchored to a binlog coordinate.
pub struct BackupEngine {
    info: DbInfo,
    config: Arc<RecoveryConfig>,
    layout: BackupLayout,
}

impl BackupEngine {
    pub fn new(info: DbInfo, config: Arc<RecoveryConfig>) -> Self {
        let layout = BackupLayout::new(config.backup_path.clone());
        Self {
            info,
            config,
            layout,
        }
    }

    /// Dump one database with mysqldump and commit the dump file under the
    /// backup uuid. The returned coordinate is where later restores start
    /// replaying from.
    pub async fn backup(&self, history: &DbBackupHistory) -> Result<BinlogInfo> {
        let dir = self
            .layout
            .backup_dir(history.db_instance_id, history.db_backup_id);
        fs::create_dir_all(&dir).await.map_err(|e| RecoveryError::FileSystem {
            message: format!("failed to create backup directory {}: {e}", dir.display()),
        })?;
        let temp_path = dir.join("backup.tmp");
        let _cleanup = TempFileGuard::new(temp_path.clone());

        let bin = self.config.tool_bin(self.info.db_type)?;
        let mut cmd = Command::new(&bin.mysqldump_path);
        cmd.arg("--host")
            .arg(&self.info.host)
            .arg("--port")
            .arg(self.info.port.to_string())
            .arg("--user")
            .arg(&self.info.username)
            .arg(format!("--password={}", self.info.password))
            .arg("--add-drop-database")
            .arg("--result-file")
            .arg(&temp_path)
            .arg("--single-transaction")
            // --master-data=2 embeds the CHANGE MASTER TO coordinates as a
            // comment in the dump header.
            .arg("--master-data=2")
            .arg("--databases")
            .arg(&history.db_name);
        debug!(database = %history.db_name, "backing up database with mysqldump");
        if let Err(e) = run_tool(cmd).await {
            error!(error = %e, "mysqldump failed");
            return Err(e);
        }

        debug!(path = %temp_path.display(), "reading binlog coordinates from the dump");
        let dump = fs::File::open(&temp_path)
            .await
            .map_err(|e| RecoveryError::FileSystem {
                message: format!("backup file {} is missing: {e}", temp_path.display()),
            })?;
        let binlog_info = read_binlog_info(BufReader::new(dump)).await?;

        let final_path = dir.join(format!("{}.sql", history.uuid));
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| RecoveryError::FileSystem {
                message: format!(
                    "failed to rename {} to {}: {e}",
                    temp_path.display(),
                    final_path.display()
                ),
            })?;

        info!(
            path = %final_path.display(),
            file = %binlog_info.file_name,
            position = binlog_info.position,
            "backup completed"
        );
        Ok(binlog_info)
    }
}
