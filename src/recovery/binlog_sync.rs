use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Local};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error};

use super::binlog::{parse_binlog_name, sort_binlog_files, BinlogFile};
use super::layout::BackupLayout;
use super::parser::parse_event_time_in_line;
use super::process::{run_tool, scan_lines};
use super::server::ServerClient;
use super::singleflight::FlightGroup;
use super::{RecoveryError, Result, TempFileGuard};
use crate::config::RecoveryConfig;
use crate::connection::{DbConnection, DbInfo};

/// Process-wide registry deduplicating concurrent fetch cycles per instance.
static FETCH_FLIGHTS: LazyLock<FlightGroup<Vec<BinlogFile>>> = LazyLock::new(FlightGroup::new);

/// Mirrors server binlog files into the per-instance binlog directory.
#[derive(Clone)]
pub struct BinlogSyncer {
    info: DbInfo,
    config: Arc<RecoveryConfig>,
    server: ServerClient,
    layout: BackupLayout,
}

impl BinlogSyncer {
    pub fn new(info: DbInfo, conn: Arc<dyn DbConnection>, config: Arc<RecoveryConfig>) -> Self {
        let layout = BackupLayout::new(config.backup_path.clone());
        Self {
            info,
            config,
            server: ServerClient::new(conn),
            layout,
        }
    }

    pub fn server(&self) -> &ServerClient {
        &self.server
    }

    fn binlog_dir(&self) -> PathBuf {
        self.layout.binlog_dir(self.info.instance_id)
    }

    pub fn binlog_file_path(&self, file_name: &str) -> PathBuf {
        self.layout.binlog_file_path(self.info.instance_id, file_name)
    }

    /// Download the binlog files spanning from a known anchor to the head of
    /// the server's catalog.
    ///
    /// `latest_binlog_sequence` is the newest sequence already mirrored
    /// locally (the window starts after it); `earliest_backup_sequence` is
    /// the fallback anchor taken from the oldest backup when nothing is local
    /// yet. Concurrent calls for one instance are coalesced into a single
    /// cycle; a caller that needs the still-growing latest file and joined a
    /// cycle that skipped it triggers one dedicated follow-up cycle and gets
    /// that cycle's files.
    pub async fn fetch_binlogs(
        &self,
        download_latest: bool,
        earliest_backup_sequence: i64,
        latest_binlog_sequence: i64,
    ) -> Result<Vec<BinlogFile>> {
        let key = format!("{:x}", self.info.instance_id);
        let syncer = self.clone();
        let (result, led) = FETCH_FLIGHTS
            .run(&key, async move {
                syncer
                    .fetch_cycle(download_latest, earliest_backup_sequence, latest_binlog_sequence)
                    .await
            })
            .await;
        let files = result?;
        if led {
            return Ok(files);
        }
        if !download_latest {
            return Ok(Vec::new());
        }
        // The shared cycle may have skipped the latest file; run a dedicated
        // round that includes it.
        let syncer = self.clone();
        let (result, _) = FETCH_FLIGHTS
            .run(&key, async move {
                syncer
                    .fetch_cycle(true, earliest_backup_sequence, latest_binlog_sequence)
                    .await
            })
            .await;
        result
    }

    async fn fetch_cycle(
        &self,
        download_latest: bool,
        earliest_backup_sequence: i64,
        latest_binlog_sequence: i64,
    ) -> Result<Vec<BinlogFile>> {
        let on_server = self.server.sorted_binlog_files().await?;
        if on_server.is_empty() {
            debug!("no binlog file found on server to download");
            return Ok(Vec::new());
        }
        let start = window_start_index(&on_server, earliest_backup_sequence, latest_binlog_sequence)?;
        let mut window = on_server[start..].to_vec();
        self.download_files(&mut window, download_latest).await?;
        Ok(window)
    }

    async fn download_files(&self, files: &mut [BinlogFile], download_latest: bool) -> Result<()> {
        if files.is_empty() {
            debug!("no binlog file found on server to download");
            return Ok(());
        }
        let dir = self.binlog_dir();
        fs::create_dir_all(&dir).await.map_err(|e| RecoveryError::FileSystem {
            message: format!("failed to create binlog directory {}: {e}", dir.display()),
        })?;
        let latest_name = files[files.len() - 1].name.clone();
        for file in files.iter_mut() {
            let is_latest = file.name == latest_name;
            if is_latest && !download_latest {
                continue;
            }
            let path = dir.join(&file.name);
            debug!(path = %path.display(), is_latest, "downloading binlog file from server");
            if let Err(e) = self.download_file(file, is_latest).await {
                error!(path = %path.display(), error = %e, "binlog download failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Fetch one binlog file in raw mode through a temp name, validate its
    /// size, and move it into place. The newest file keeps growing while the
    /// server takes writes, so only archived files must match the size the
    /// server reported earlier.
    async fn download_file(&self, file: &mut BinlogFile, is_latest: bool) -> Result<()> {
        let dir = self.binlog_dir();
        let temp_prefix = dir.join("tmp-");
        let bin = self.config.tool_bin(self.info.db_type)?;

        let mut cmd = Command::new(&bin.mysqlbinlog_path);
        cmd.arg(&file.name)
            .arg("--read-from-remote-server")
            .arg("--verify-binlog-checksum")
            .arg("--host")
            .arg(&self.info.host)
            .arg("--port")
            .arg(self.info.port.to_string())
            .arg("--user")
            .arg(&self.info.username)
            .arg("--raw")
            // With --raw, --result-file is a prefix for the written file name.
            .arg("--result-file")
            .arg(&temp_prefix);
        // A --password flag would make mysqlbinlog warn about insecure
        // passwords on stderr, which we treat as the error payload.
        if !self.info.password.is_empty() {
            cmd.env("MYSQL_PWD", &self.info.password);
        }

        let temp_path = dir.join(format!("tmp-{}", file.name));
        let _cleanup = TempFileGuard::new(temp_path.clone());
        run_tool(cmd).await?;

        debug!(path = %temp_path.display(), "checking downloaded binlog file");
        let metadata = fs::metadata(&temp_path)
            .await
            .map_err(|e| RecoveryError::FileSystem {
                message: format!("downloaded binlog file {} is missing: {e}", temp_path.display()),
            })?;
        validate_downloaded_size(file, metadata.len() as i64, is_latest)?;

        let final_path = dir.join(&file.name);
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| RecoveryError::FileSystem {
                message: format!(
                    "failed to rename {} to {}: {e}",
                    temp_path.display(),
                    final_path.display()
                ),
            })?;

        file.first_event_time = Some(self.first_event_time(&final_path).await?);
        file.downloaded = true;
        Ok(())
    }

    /// Timestamp of the first event in a local binlog file.
    async fn first_event_time(&self, path: &Path) -> Result<DateTime<Local>> {
        let bin = self.config.tool_bin(self.info.db_type)?;
        let mut cmd = Command::new(&bin.mysqlbinlog_path);
        cmd.arg(path)
            .arg("--verify-binlog-checksum")
            // DECODE-ROWS suppresses the BINLOG statements for row events.
            .arg("--base64-output=DECODE-ROWS");
        let scan = scan_lines(cmd, parse_event_time_in_line).await?;
        match scan.value {
            Some(time) => Ok(time),
            None => {
                let mut message =
                    format!("no event timestamp found in binlog file {}", path.display());
                if scan.tool_failed && !scan.stderr.is_empty() {
                    message = format!("{message}: {}", scan.stderr);
                }
                Err(RecoveryError::Parse { message })
            }
        }
    }

    /// Binlog files already mirrored locally, ascending by sequence. Leftover
    /// temp files and foreign names are skipped.
    pub async fn local_binlog_files(&self) -> Result<Vec<BinlogFile>> {
        let dir = self.binlog_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RecoveryError::FileSystem {
                    message: format!("failed to read binlog directory {}: {e}", dir.display()),
                })
            }
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| RecoveryError::FileSystem {
            message: format!("failed to read binlog directory {}: {e}", dir.display()),
        })? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with("tmp-") {
                continue;
            }
            let Ok((_, sequence)) = parse_binlog_name(&name) else {
                continue;
            };
            let metadata = entry.metadata().await.map_err(|e| RecoveryError::FileSystem {
                message: format!("failed to stat binlog file {name}: {e}"),
            })?;
            files.push(BinlogFile {
                name,
                sequence,
                size: metadata.len() as i64,
                first_event_time: None,
                downloaded: true,
            });
        }
        Ok(sort_binlog_files(&files))
    }
}

/// Locate where the download window starts in the server's sorted catalog.
/// The file matching `latest_binlog_sequence` is already local, so the window
/// opens just after it; a match on `earliest_backup_sequence` opens the
/// window at the match itself. Past-the-end clamps to the last file.
fn window_start_index(
    files: &[BinlogFile],
    earliest_backup_sequence: i64,
    latest_binlog_sequence: i64,
) -> Result<usize> {
    let mut start = None;
    for (i, file) in files.iter().enumerate() {
        if file.sequence == latest_binlog_sequence {
            start = Some(i + 1);
            break;
        }
        if file.sequence == earliest_backup_sequence {
            start = Some(i);
            break;
        }
    }
    let Some(start) = start else {
        return Err(RecoveryError::NotFound {
            message: format!(
                "no binlog file on the server matches sequence {earliest_backup_sequence} or {latest_binlog_sequence}"
            ),
        });
    };
    Ok(start.min(files.len() - 1))
}

/// Archived files must match the size the server reported; the newest file
/// may still be growing, so any size is accepted for it.
fn validate_downloaded_size(file: &BinlogFile, actual: i64, is_latest: bool) -> Result<()> {
    if !is_latest && actual != file.size {
        return Err(RecoveryError::SizeMismatch {
            name: file.name.clone(),
            expected: file.size,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, sequence: i64, size: i64) -> BinlogFile {
        BinlogFile {
            name: name.to_string(),
            sequence,
            size,
            first_event_time: None,
            downloaded: false,
        }
    }

    fn catalog() -> Vec<BinlogFile> {
        vec![
            file("bl.000001", 1, 100),
            file("bl.000002", 2, 100),
            file("bl.000003", 3, 100),
            file("bl.000004", 4, 100),
        ]
    }

    #[test]
    fn test_window_opens_after_the_locally_known_sequence() {
        let start = window_start_index(&catalog(), -1, 2).unwrap();
        assert_eq!(start, 2);
    }

    #[test]
    fn test_window_opens_at_the_backup_anchor() {
        let start = window_start_index(&catalog(), 2, -1).unwrap();
        assert_eq!(start, 1);
    }

    #[test]
    fn test_window_clamps_when_local_state_is_at_the_head() {
        let start = window_start_index(&catalog(), -1, 4).unwrap();
        assert_eq!(start, 3);
    }

    #[test]
    fn test_unknown_anchors_are_not_found() {
        assert!(matches!(
            window_start_index(&catalog(), 9, 7),
            Err(RecoveryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_archived_file_size_must_match() {
        let older = file("bl.000001", 1, 100);
        assert!(matches!(
            validate_downloaded_size(&older, 90, false),
            Err(RecoveryError::SizeMismatch { .. })
        ));
        assert!(validate_downloaded_size(&older, 100, false).is_ok());
    }

    #[test]
    fn test_growing_latest_file_accepts_any_size() {
        let latest = file("bl.000004", 4, 100);
        assert!(validate_downloaded_size(&latest, 37, true).is_ok());
        assert!(validate_downloaded_size(&latest, 170, true).is_ok());
    }
}
