use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::binlog::{sort_binlog_files, BinlogFile, BinlogInfo};
use super::layout::BackupLayout;
use super::parser::parse_event_pos_in_line;
use super::process::{pipe_tools, run_tool, run_tool_with_stdin, scan_lines};
use super::server::ServerClient;
use super::{RecoveryError, Result};
use crate::config::RecoveryConfig;
use crate::connection::{DbConnection, DbInfo};

/// Replay plan between two binlog coordinates: the span of local binlog
/// files to feed through `mysqlbinlog`, bounded by a start and a stop byte
/// position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreInfo {
    pub start_position: i64,
    pub target_position: i64,
    binlog_file_names: Vec<String>,
}

impl RestoreInfo {
    /// Build a plan over `files`. The span from the start coordinate's file
    /// through `target_sequence` must be fully present and contiguous;
    /// replaying across a hole would silently skip events.
    pub fn new(
        start: &BinlogInfo,
        target_sequence: i64,
        target_position: i64,
        files: &[BinlogFile],
    ) -> Result<Self> {
        let sorted = sort_binlog_files(files);
        let span: Vec<&BinlogFile> = sorted
            .iter()
            .filter(|file| file.sequence >= start.sequence && file.sequence <= target_sequence)
            .collect();
        let Some(first) = span.first() else {
            return Err(RecoveryError::NotFound {
                message: format!(
                    "no local binlog file covers sequences {} through {target_sequence}",
                    start.sequence
                ),
            });
        };
        if first.sequence != start.sequence {
            return Err(RecoveryError::NotFound {
                message: format!(
                    "local binlog span starts at sequence {} instead of {}",
                    first.sequence, start.sequence
                ),
            });
        }
        for pair in span.windows(2) {
            if pair[1].sequence != pair[0].sequence + 1 {
                return Err(RecoveryError::NotFound {
                    message: format!(
                        "local binlog span has a hole between sequences {} and {}",
                        pair[0].sequence, pair[1].sequence
                    ),
                });
            }
        }
        let last = span[span.len() - 1];
        if last.sequence != target_sequence {
            return Err(RecoveryError::NotFound {
                message: format!(
                    "local binlog span ends at sequence {} instead of {target_sequence}",
                    last.sequence
                ),
            });
        }
        Ok(Self {
            start_position: start.position,
            target_position,
            binlog_file_names: span.iter().map(|file| file.name.clone()).collect(),
        })
    }

    pub fn binlog_file_names(&self) -> &[String] {
        &self.binlog_file_names
    }

    /// Absolute replay inputs, in replay order.
    pub fn binlog_paths(&self, binlog_dir: &Path) -> Vec<PathBuf> {
        self.binlog_file_names
            .iter()
            .map(|name| binlog_dir.join(name))
            .collect()
    }
}

/// Restores a committed dump and replays binlog events on top of it.
pub struct ReplayEngine {
    info: DbInfo,
    config: Arc<RecoveryConfig>,
    server: ServerClient,
    layout: BackupLayout,
}

impl ReplayEngine {
    pub fn new(info: DbInfo, conn: Arc<dyn DbConnection>, config: Arc<RecoveryConfig>) -> Self {
        let layout = BackupLayout::new(config.backup_path.clone());
        Self {
            info,
            config,
            server: ServerClient::new(conn),
            layout,
        }
    }

    /// Load a committed dump into `db_name` through the mysql client.
    pub async fn restore_backup_history(
        &self,
        db_name: &str,
        db_backup_id: u64,
        backup_uuid: &Uuid,
    ) -> Result<()> {
        let dump_path = self
            .layout
            .backup_dir(self.info.instance_id, db_backup_id)
            .join(format!("{backup_uuid}.sql"));
        let dump = fs::File::open(&dump_path)
            .await
            .map_err(|e| RecoveryError::FileSystem {
                message: format!("failed to open backup file {}: {e}", dump_path.display()),
            })?;
        let dump = dump.into_std().await;

        let bin = self.config.tool_bin(self.info.db_type)?;
        let mut cmd = Command::new(&bin.mysql_path);
        cmd.arg("--host")
            .arg(&self.info.host)
            .arg("--port")
            .arg(self.info.port.to_string())
            .arg("--database")
            .arg(db_name)
            .arg("--user")
            .arg(&self.info.username)
            .arg(format!("--password={}", self.info.password));
        debug!(database = db_name, path = %dump_path.display(), "restoring database from dump");
        run_tool_with_stdin(cmd, Stdio::from(dump)).await?;
        info!(database = db_name, "base restore completed");
        Ok(())
    }

    /// Replay binlog events recorded for `original_db` into `target_db`
    /// between the plan's start and stop positions.
    pub async fn replay_binlog(
        &self,
        original_db: &str,
        target_db: &str,
        restore_info: &RestoreInfo,
    ) -> Result<()> {
        let case_mode = self.server.server_variable("lower_case_table_names").await?;
        let source_db = rewritten_source_db(original_db, &case_mode)?;

        let bin = self.config.tool_bin(self.info.db_type)?;
        let binlog_dir = self.layout.binlog_dir(self.info.instance_id);

        let mut producer = Command::new(&bin.mysqlbinlog_path);
        producer
            .arg("--verify-binlog-checksum")
            // Replayed events must not land in the target's own binlog.
            .arg("--disable-log-bin")
            .arg("--rewrite-db")
            .arg(format!("{source_db}->{target_db}"))
            // --database filters after --rewrite-db, so it names the target.
            .arg("--database")
            .arg(target_db)
            .arg("--start-position")
            .arg(restore_info.start_position.to_string())
            .arg("--stop-position")
            .arg(restore_info.target_position.to_string());
        for path in restore_info.binlog_paths(&binlog_dir) {
            producer.arg(path);
        }

        let mut consumer = Command::new(&bin.mysql_path);
        consumer
            .arg("--host")
            .arg(&self.info.host)
            .arg("--port")
            .arg(self.info.port.to_string())
            .arg("--user")
            .arg(&self.info.username);
        if !self.info.password.is_empty() {
            // The space-separated --password form makes the client prompt and
            // hang; only the equals form works here.
            consumer.arg(format!("--password={}", self.info.password));
        }

        debug!(
            producer = ?producer.as_std(),
            consumer = ?consumer.as_std(),
            "replaying binlog"
        );
        pipe_tools(producer, consumer).await?;
        info!(
            start = restore_info.start_position,
            stop = restore_info.target_position,
            "binlog replay completed"
        );
        Ok(())
    }

    /// Position of the first event at or after `target_time` in a local
    /// binlog file. The synthetic FORMAT_DESCRIPTION_EVENT that
    /// `--start-datetime` always emits first sits at position 4 and is
    /// skipped.
    pub async fn event_position_at_or_after(
        &self,
        binlog_name: &str,
        target_time: DateTime<Local>,
    ) -> Result<i64> {
        let path = self
            .layout
            .binlog_file_path(self.info.instance_id, binlog_name);
        let bin = self.config.tool_bin(self.info.db_type)?;
        let mut cmd = Command::new(&bin.mysqlbinlog_path);
        cmd.arg(&path)
            .arg("--verify-binlog-checksum")
            .arg("--base64-output=DECODE-ROWS")
            // Output starts at the first event with a timestamp at or after
            // the target.
            .arg("--start-datetime")
            .arg(target_time.format("%Y-%m-%d %H:%M:%S").to_string());
        let scan = scan_lines(cmd, parse_replay_position).await?;
        match scan.value {
            Some(position) => Ok(position),
            None => {
                let mut message = format!(
                    "no binlog event at or after {} in {}",
                    target_time.format("%Y-%m-%d %H:%M:%S"),
                    binlog_name
                );
                if scan.tool_failed && !scan.stderr.is_empty() {
                    message = format!("{message}: {}", scan.stderr);
                }
                Err(RecoveryError::NotFound { message })
            }
        }
    }

    /// Resolve `target_time` into a validated replay plan. `files` are the
    /// locally mirrored binlog files, each stamped with its first event
    /// time; the plan spans from the start coordinate through the file the
    /// target instant falls into.
    pub async fn plan_restore(
        &self,
        files: &[BinlogFile],
        start: &BinlogInfo,
        target_time: DateTime<Local>,
    ) -> Result<RestoreInfo> {
        let sorted = sort_binlog_files(files);
        let mut target_file = None;
        for file in sorted.iter().filter(|file| file.sequence >= start.sequence) {
            let Some(first_event_time) = file.first_event_time else {
                return Err(RecoveryError::Parse {
                    message: format!(
                        "binlog file {} is not stamped with its first event time",
                        file.name
                    ),
                });
            };
            if first_event_time <= target_time {
                target_file = Some(file);
            } else {
                break;
            }
        }
        let Some(target_file) = target_file else {
            return Err(RecoveryError::NotFound {
                message: format!(
                    "no local binlog file contains events before {}",
                    target_time.format("%Y-%m-%d %H:%M:%S")
                ),
            });
        };
        let target_position = self
            .event_position_at_or_after(&target_file.name, target_time)
            .await?;
        RestoreInfo::new(start, target_file.sequence, target_position, &sorted)
    }

    /// Run an ad-hoc statement through the mysql client, e.g. creating the
    /// scratch database a recovery replays into.
    pub async fn execute(&self, database: Option<&str>, sql: &str) -> Result<()> {
        let bin = self.config.tool_bin(self.info.db_type)?;
        let mut cmd = Command::new(&bin.mysql_path);
        cmd.arg("--host")
            .arg(&self.info.host)
            .arg("--port")
            .arg(self.info.port.to_string())
            .arg("--user")
            .arg(&self.info.username)
            .arg(format!("--password={}", self.info.password))
            .arg("--execute")
            .arg(sql);
        if let Some(database) = database {
            cmd.arg(database);
        }
        debug!(statement = sql, "executing statement through mysql");
        run_tool(cmd).await
    }
}

/// Visitor for position lines when seeking by datetime. With
/// `--start-datetime` the first valid event is always the synthetic
/// FORMAT_DESCRIPTION_EVENT at position 4, which must not become the stop
/// position.
fn parse_replay_position(line: &str) -> Result<Option<i64>> {
    match parse_event_pos_in_line(line)? {
        Some(4) | None => Ok(None),
        Some(position) => Ok(Some(position)),
    }
}

/// Database names inside the binlog appear the way the server stores them,
/// which `lower_case_table_names` governs: 0 stores and compares as written,
/// 1 stores lowercased, 2 stores as written but compares lowercased. The
/// rewrite rule must name the stored form.
fn rewritten_source_db(original_db: &str, lower_case_table_names: &str) -> Result<String> {
    let value = lower_case_table_names
        .trim()
        .parse::<i64>()
        .map_err(|e| RecoveryError::ServerQuery {
            message: format!(
                "unexpected lower_case_table_names value {lower_case_table_names:?}: {e}"
            ),
        })?;
    match value {
        0 => Ok(original_db.to_string()),
        1 | 2 => Ok(original_db.to_lowercase()),
        other => Err(RecoveryError::ServerQuery {
            message: format!(
                "unexpected lower_case_table_names value {other}, expected 0, 1 or 2"
            ),
        }),
    }
}
