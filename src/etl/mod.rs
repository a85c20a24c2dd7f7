/// ETL Module
///
/// The two stages of the credit sync and the seams between them:
/// - Extract: read credit records from the source store (`CreditSource`)
/// - Load: replace the staging table in the destination store (`CreditSink`)
///
/// Each stage owns its connection for the duration of one call and closes it
/// before returning, whatever the outcome.
pub mod extract;
pub mod load;

use crate::models::CreditRecord;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Extraction failures. Boxed driver errors keep both source drivers behind
/// one type.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to connect to source: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("source query failed: {0}")]
    Query(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("source {stage} timed out after {}s", .after.as_secs())]
    Timeout { stage: &'static str, after: Duration },

    #[error("failed to decode column {column} of source row {row}: {reason}")]
    Decode { row: usize, column: &'static str, reason: String },
}

/// Load failures, by the step that failed
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to connect to destination: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("failed to clear staging table: {0}")]
    Truncate(#[source] sqlx::Error),

    #[error("failed to start staging table transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("failed to insert into staging table: {0}")]
    Insert(#[source] sqlx::Error),

    #[error("failed to commit staging table insert: {0}")]
    Commit(#[source] sqlx::Error),
}

/// Where credit records come from
#[async_trait]
pub trait CreditSource: Send + Sync {
    /// Credential-free label for logs
    fn describe(&self) -> String;

    /// Check that the source store is reachable
    async fn check(&self) -> Result<(), FetchError>;

    /// Run the source query and return every row
    async fn fetch(&self) -> Result<Vec<CreditRecord>, FetchError>;
}

/// Where credit records go
#[async_trait]
pub trait CreditSink: Send + Sync {
    /// Credential-free label for logs
    fn describe(&self) -> String;

    /// Check that the destination store is reachable
    async fn check(&self) -> Result<(), LoadError>;

    /// Replace the staging table contents with `records`, returning the
    /// number of rows inserted
    async fn replace(&self, records: &[CreditRecord]) -> Result<u64, LoadError>;
}
