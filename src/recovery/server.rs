use std::sync::Arc;

use tracing::debug;

use super::binlog::{parse_binlog_name, sort_binlog_files, BinlogFile};
use super::{RecoveryError, Result};
use crate::connection::{DbConnection, QueryValue};

/// Read-only metadata client over the injected SQL connection.
#[derive(Clone)]
pub struct ServerClient {
    conn: Arc<dyn DbConnection>,
}

impl ServerClient {
    pub fn new(conn: Arc<dyn DbConnection>) -> Self {
        Self { conn }
    }

    /// Binlog files currently registered on the server, ascending by their
    /// numeric sequence.
    pub async fn sorted_binlog_files(&self) -> Result<Vec<BinlogFile>> {
        const QUERY: &str = "SHOW BINARY LOGS";
        let output = self
            .conn
            .query(QUERY)
            .await
            .map_err(|e| RecoveryError::ServerQuery {
                message: format!("{QUERY:?} failed: {e:#}"),
            })?;
        let has_name = output.columns.iter().any(|column| column == "Log_name");
        let has_size = output.columns.iter().any(|column| column == "File_size");
        if !has_name || !has_size {
            return Err(RecoveryError::ServerQuery {
                message: format!("{QUERY:?} returned an unexpected column set: {:?}", output.columns),
            });
        }

        let mut files = Vec::with_capacity(output.rows.len());
        for row in &output.rows {
            let name = row.get("Log_name").and_then(QueryValue::as_str);
            let size = row.get("File_size").and_then(QueryValue::as_u64);
            let (Some(name), Some(size)) = (name, size) else {
                return Err(RecoveryError::ServerQuery {
                    message: format!("{QUERY:?} returned a row with unexpected value types"),
                });
            };
            let (_, sequence) = parse_binlog_name(name)?;
            files.push(BinlogFile {
                name: name.to_string(),
                sequence,
                size: size as i64,
                first_event_time: None,
                downloaded: false,
            });
        }
        debug!(count = files.len(), "listed binlog files on server");
        Ok(sort_binlog_files(&files))
    }

    /// Look up a single server variable through `SHOW VARIABLES LIKE`.
    pub async fn server_variable(&self, name: &str) -> Result<String> {
        let query = format!("SHOW VARIABLES LIKE '{name}'");
        let output = self
            .conn
            .query(&query)
            .await
            .map_err(|e| RecoveryError::ServerQuery {
                message: format!("{query:?} failed: {e:#}"),
            })?;
        let Some(row) = output.rows.first() else {
            return Err(RecoveryError::NotFound {
                message: format!("server variable {name} does not exist"),
            });
        };
        let found = row.get("Variable_name").and_then(QueryValue::as_str);
        if found != Some(name) {
            return Err(RecoveryError::ServerQuery {
                message: format!("{query:?} returned variable {found:?} instead of {name}"),
            });
        }
        let Some(value) = row.get("Value").and_then(QueryValue::as_str) else {
            return Err(RecoveryError::ServerQuery {
                message: format!("{query:?} returned a row with unexpected value types"),
            });
        };
        Ok(value.to_string())
    }

    /// Binary logging must be on for any of the binlog machinery to work.
    pub async fn check_binlog_enabled(&self) -> Result<()> {
        let value = self.server_variable("log_bin").await?;
        if !value.eq_ignore_ascii_case("ON") {
            return Err(RecoveryError::ServerQuery {
                message: "binary logging is not enabled on the server".to_string(),
            });
        }
        Ok(())
    }

    /// Replay into a renamed database relies on row-based logging.
    pub async fn check_binlog_row_format(&self) -> Result<()> {
        let value = self.server_variable("binlog_format").await?;
        if !value.eq_ignore_ascii_case("ROW") {
            return Err(RecoveryError::ServerQuery {
                message: format!("binlog format {value} is not ROW"),
            });
        }
        Ok(())
    }
}
