pub mod config;
pub mod connection;
pub mod recovery;

pub use config::{DbType, MysqlBin, RecoveryConfig};
pub use connection::{DbConnection, DbInfo, QueryOutput, QueryValue, SqlxConnection};

// Re-export the recovery engine surface
pub use recovery::{
    parse_binlog_name, sort_binlog_files, BackupEngine, BackupLayout, BinlogFile, BinlogInfo,
    BinlogSyncer, DbBackupHistory, RecoveryError, ReplayEngine, RestoreInfo, Result, ServerClient,
};
