use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Column, Executor, MySqlPool, Row};

use crate::config::DbType;

/// Connection descriptor for one server instance. Immutable for the lifetime
/// of the engines built on top of it.
#[derive(Debug, Clone)]
pub struct DbInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub instance_id: u64,
    pub db_type: DbType,
}

/// A single cell of a metadata query result. Server metadata queries only
/// ever yield text and unsigned integer columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Text(String),
    Unsigned(u64),
    Null,
}

impl QueryValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            QueryValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            QueryValue::Unsigned(value) => Some(*value),
            _ => None,
        }
    }
}

/// Column names plus rows keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, QueryValue>>,
}

/// The SQL seam the engines query server metadata through. The engines never
/// close the connection; its lifecycle belongs to the caller.
#[async_trait]
pub trait DbConnection: Send + Sync {
    async fn query(&self, sql: &str) -> anyhow::Result<QueryOutput>;
}

/// `DbConnection` over an sqlx MySQL pool.
pub struct SqlxConnection {
    pool: MySqlPool,
}

impl SqlxConnection {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DbConnection for SqlxConnection {
    async fn query(&self, sql: &str) -> anyhow::Result<QueryOutput> {
        // The column set comes from preparing the statement, so it is known
        // even when the result has no rows.
        let describe = self.pool.describe(sql).await?;
        let mut output = QueryOutput {
            columns: describe
                .columns
                .iter()
                .map(|column| column.name().to_string())
                .collect(),
            rows: Vec::new(),
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        for row in &rows {
            let mut record = HashMap::new();
            for (i, column) in row.columns().iter().enumerate() {
                let value = if let Ok(unsigned) = row.try_get::<u64, _>(i) {
                    QueryValue::Unsigned(unsigned)
                } else if let Ok(signed) = row.try_get::<i64, _>(i) {
                    u64::try_from(signed).map_or(QueryValue::Null, QueryValue::Unsigned)
                } else if let Ok(text) = row.try_get::<String, _>(i) {
                    QueryValue::Text(text)
                } else {
                    QueryValue::Null
                };
                record.insert(column.name().to_string(), value);
            }
            output.rows.push(record);
        }
        Ok(output)
    }
}
