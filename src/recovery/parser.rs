use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::binlog::BinlogInfo;
use super::{RecoveryError, Result};

/// Parse the event timestamp out of one line of `mysqlbinlog` text output.
///
/// The target lines look like `#220421 14:49:26 server id 1 end_log_pos 34794 ...`.
/// Fake events are emitted with `end_log_pos 0` and carry no usable timestamp,
/// so they read as not-found. Any other line mentioning `server id` that does
/// not match the expected shape is an error rather than a silent skip.
pub fn parse_event_time_in_line(line: &str) -> Result<Option<DateTime<Local>>> {
    if !line.contains("server id") {
        return Ok(None);
    }
    if line.contains("end_log_pos 0") {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 7
        || fields[0].len() != 7
        || fields[2] != "server"
        || fields[3] != "id"
        || fields[5] != "end_log_pos"
    {
        return Err(RecoveryError::Parse {
            message: format!(
                "unexpected mysqlbinlog output line {line:?} when parsing the binlog event timestamp"
            ),
        });
    }
    let datetime = NaiveDateTime::parse_from_str(
        &format!("{} {}", &fields[0][1..], fields[1]),
        "%y%m%d %H:%M:%S",
    )
    .map_err(|e| RecoveryError::Parse {
        message: format!("invalid binlog event timestamp in line {line:?}: {e}"),
    })?;
    // Binlog headers carry wall-clock times in the server's local time zone.
    let datetime = datetime
        .and_local_timezone(Local)
        .earliest()
        .ok_or_else(|| RecoveryError::Parse {
            message: format!("binlog event timestamp in line {line:?} does not exist in local time"),
        })?;
    Ok(Some(datetime))
}

/// Parse the event start position out of one line of `mysqlbinlog` output.
/// Positions appear on lines like `# at 35065`.
pub fn parse_event_pos_in_line(line: &str) -> Result<Option<i64>> {
    if !line.starts_with("# at ") {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(RecoveryError::Parse {
            message: format!(
                "unexpected mysqlbinlog output line {line:?} when parsing the binlog event start position"
            ),
        });
    }
    let position = fields[2].parse::<i64>().map_err(|e| RecoveryError::Parse {
        message: format!("invalid binlog event start position in line {line:?}: {e}"),
    })?;
    Ok(Some(position))
}

const REPLICATION_POSITION_SENTINEL: &str =
    "-- Position to start replication or point-in-time recovery from";

/// Extract the `CHANGE MASTER TO` coordinates a `--master-data=2` dump embeds
/// in its header. Only the first 100 lines are scanned; the coordinates sit
/// right below the sentinel comment and the first match wins.
pub async fn read_binlog_info<R>(reader: R) -> Result<BinlogInfo>
where
    R: AsyncBufRead + Unpin,
{
    let pattern = Regex::new(
        r"CHANGE MASTER TO MASTER_LOG_FILE='([^.]+).([0-9]+)', MASTER_LOG_POS=([0-9]+);",
    )
    .expect("replication coordinate pattern is valid");

    const MAX_MATCH_ROWS: usize = 100;
    let mut lines = reader.lines();
    let mut matching = false;
    for _ in 0..MAX_MATCH_ROWS {
        let line = lines.next_line().await.map_err(|e| RecoveryError::Parse {
            message: format!("failed to read the dump header: {e}"),
        })?;
        let Some(line) = line else { break };
        if !matching {
            if line == REPLICATION_POSITION_SENTINEL {
                matching = true;
            } else {
                continue;
            }
        }
        let Some(captures) = pattern.captures(&line) else {
            continue;
        };
        let sequence = captures[2].parse::<i64>().map_err(|e| RecoveryError::Parse {
            message: format!("invalid binlog sequence in dump header line {line:?}: {e}"),
        })?;
        let position = captures[3].parse::<i64>().map_err(|e| RecoveryError::Parse {
            message: format!("invalid binlog position in dump header line {line:?}: {e}"),
        })?;
        return Ok(BinlogInfo {
            file_name: format!("{}.{}", &captures[1], &captures[2]),
            sequence,
            position,
        });
    }
    Err(RecoveryError::Parse {
        message: "no replication coordinates found in the dump header".to_string(),
    })
}
