use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::{RecoveryError, Result};

/// One binary log file, as reported by the server or mirrored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinlogFile {
    /// File name of the shape `<base>.<sequence>`
    pub name: String,

    /// Numeric ordering key taken from the name's suffix
    pub sequence: i64,

    /// Size in bytes as reported by the server
    pub size: i64,

    /// Timestamp of the first event, known only after a local parse
    pub first_event_time: Option<DateTime<Local>>,

    /// Whether the file has been mirrored into the local binlog directory
    pub downloaded: bool,
}

/// A replication coordinate: a binlog file plus a byte offset within it.
/// Returned by a backup and consumed by a restore as its start position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogInfo {
    pub file_name: String,
    pub sequence: i64,
    pub position: i64,
}

/// Split a binlog file name into its base name and numeric sequence.
///
/// Examples:
///   - `"binlog.000001"` => `("binlog", 1)`
///   - `"binlog000001"` => error
pub fn parse_binlog_name(name: &str) -> Result<(&str, i64)> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 2 {
        return Err(RecoveryError::Parse {
            message: format!(
                "expected two dot-separated parts in binlog file name {name:?}, got {}",
                parts.len()
            ),
        });
    }
    let sequence = parts[1].parse::<i64>().map_err(|e| RecoveryError::Parse {
        message: format!("invalid sequence number {:?} in binlog file name {name:?}: {e}", parts[1]),
    })?;
    Ok((parts[0], sequence))
}

/// Sort binlog files ascending by their numeric sequence. After sequence
/// 999999 the server continues with 1000000, so comparing names
/// lexicographically would order the rollover wrong.
pub fn sort_binlog_files(files: &[BinlogFile]) -> Vec<BinlogFile> {
    let mut sorted = files.to_vec();
    sorted.sort_by_key(|file| file.sequence);
    sorted
}
