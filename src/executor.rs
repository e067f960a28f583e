//! SQL execution boundary. The engine only produces statement strings; this
//! module carries them to the database, one immediately-committed
//! connection per statement.
use async_trait::async_trait;
use sqlx::{AnyConnection, Connection, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlError {
    /// Cannot open a connection. Fatal for the current job file.
    #[error("cannot open database connection: {0}")]
    Connectivity(#[source] sqlx::Error),
    /// A single statement failed. The caller logs it and moves on.
    #[error("statement failed: {0}")]
    Statement(#[source] sqlx::Error),
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute a statement, discarding any result rows.
    async fn execute(&self, statement: &str) -> Result<(), SqlError>;

    /// Execute a statement and return the first column of each row as text.
    async fn query_strings(&self, statement: &str) -> Result<Vec<String>, SqlError>;
}

/// Executor over any sqlx-supported database URL. Call
/// `sqlx::any::install_default_drivers()` once at startup before use.
pub struct AnyExecutor {
    url: String,
}

impl AnyExecutor {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn connect(&self) -> Result<AnyConnection, SqlError> {
        AnyConnection::connect(&self.url)
            .await
            .map_err(SqlError::Connectivity)
    }
}

#[async_trait]
impl SqlExecutor for AnyExecutor {
    async fn execute(&self, statement: &str) -> Result<(), SqlError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query(statement)
            .execute(&mut conn)
            .await
            .map_err(SqlError::Statement);
        let _ = conn.close().await;
        result.map(|_| ())
    }

    async fn query_strings(&self, statement: &str) -> Result<Vec<String>, SqlError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query(statement)
            .fetch_all(&mut conn)
            .await
            .map_err(SqlError::Statement);
        let _ = conn.close().await;
        let rows = result?;
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            values.push(row.try_get::<String, _>(0).map_err(SqlError::Statement)?);
        }
        Ok(values)
    }
}
