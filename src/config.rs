use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::recovery::{RecoveryError, Result};

/// Flavor of the server a connection points at. Both flavors speak the same
/// client tooling; they may be installed under different prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbType {
    MySql,
    MariaDb,
}

/// Paths to the client tools used to drive a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlBin {
    pub mysql_path: PathBuf,
    pub mysqldump_path: PathBuf,
    pub mysqlbinlog_path: PathBuf,
}

impl MysqlBin {
    /// Tool paths inside `dir`, or bare names resolved through PATH when no
    /// directory is given.
    pub fn in_dir(dir: Option<&str>) -> Self {
        let tool = |name: &str| match dir {
            Some(dir) => Path::new(dir).join(name),
            None => PathBuf::from(name),
        };
        Self {
            mysql_path: tool("mysql"),
            mysqldump_path: tool("mysqldump"),
            mysqlbinlog_path: tool("mysqlbinlog"),
        }
    }
}

/// Backup root and per-flavor tool paths for the recovery engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Root directory all backup and binlog files live under
    pub backup_path: PathBuf,

    /// Client tools used for MySQL instances
    pub mysql_bin: MysqlBin,

    /// Client tools used for MariaDB instances
    pub mariadb_bin: MysqlBin,
}

impl RecoveryConfig {
    pub fn from_env() -> Self {
        let backup_path = env::var("PITR_BACKUP_PATH")
            .unwrap_or_else(|_| "/var/lib/mysql-pitr/backups".to_string());
        Self {
            backup_path: PathBuf::from(backup_path),
            mysql_bin: MysqlBin::in_dir(env::var("PITR_MYSQL_BIN_DIR").ok().as_deref()),
            mariadb_bin: MysqlBin::in_dir(env::var("PITR_MARIADB_BIN_DIR").ok().as_deref()),
        }
    }

    /// The tool set for one server flavor. Fails if any tool path is blank.
    pub fn tool_bin(&self, db_type: DbType) -> Result<&MysqlBin> {
        let bin = match db_type {
            DbType::MySql => &self.mysql_bin,
            DbType::MariaDb => &self.mariadb_bin,
        };
        if bin.mysql_path.as_os_str().is_empty()
            || bin.mysqldump_path.as_os_str().is_empty()
            || bin.mysqlbinlog_path.as_os_str().is_empty()
        {
            return Err(RecoveryError::Config {
                message: format!("incomplete client tool paths configured for {db_type:?}"),
            });
        }
        Ok(bin)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_path.as_os_str().is_empty() {
            return Err(RecoveryError::Config {
                message: "backup path is not configured".to_string(),
            });
        }
        self.tool_bin(DbType::MySql)?;
        self.tool_bin(DbType::MariaDb)?;
        Ok(())
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backup_path: PathBuf::from("/var/lib/mysql-pitr/backups"),
            mysql_bin: MysqlBin::in_dir(None),
            mariadb_bin: MysqlBin::in_dir(None),
        }
    }
}
