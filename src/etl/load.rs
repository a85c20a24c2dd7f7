/// Load Module
///
/// Replaces the contents of the MySQL staging table with the extracted
/// records.
///
/// In the default `truncate` mode the table is emptied with TRUNCATE, which
/// MySQL commits on its own, and the rows are then inserted in a separate
/// transaction. If the insert fails the rollback only undoes the insert and the
/// staging table stays empty until the next successful run.
///
/// In `transactional` mode the table is emptied with DELETE inside the insert
/// transaction, so a failed insert leaves the previous contents in place.
use crate::config::{LoadConfig, LoadMode, MysqlConfig};
use crate::etl::{CreditSink, LoadError};
use crate::models::{CreditRecord, STAGING_TABLE};
use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlConnection},
    Connection, MySql, QueryBuilder, Transaction,
};
use tracing::{debug, error, info, warn};

pub struct MySqlSink {
    config: MysqlConfig,
    load: LoadConfig,
}

impl MySqlSink {
    pub fn new(config: MysqlConfig, load: LoadConfig) -> Self {
        Self { config, load }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(self.config.password.expose())
            .database(&self.config.database)
            .charset(&self.config.charset)
    }

    async fn connect(&self) -> Result<MySqlConnection, LoadError> {
        MySqlConnection::connect_with(&self.connect_options()).await.map_err(LoadError::Connect)
    }

    async fn close(conn: MySqlConnection) {
        if let Err(e) = conn.close().await {
            warn!("Failed to close MySQL connection cleanly: {}", e);
        }
    }

    /// Clear the table and insert `records` according to the load mode
    async fn replace_contents(&self, conn: &mut MySqlConnection, records: &[CreditRecord]) -> Result<u64, LoadError> {
        if self.load.mode == LoadMode::Truncate {
            sqlx::query(&truncate_statement()).execute(&mut *conn).await.map_err(LoadError::Truncate)?;
            debug!("Truncated {}", STAGING_TABLE);
        }

        let mut tx = conn.begin().await.map_err(LoadError::Begin)?;

        let inserted = match self.write_rows(&mut tx, records).await {
            Ok(inserted) => inserted,
            Err(e) => {
                rollback(tx).await;
                return Err(e);
            }
        };

        tx.commit().await.map_err(LoadError::Commit)?;
        Ok(inserted)
    }

    async fn write_rows(&self, tx: &mut Transaction<'_, MySql>, records: &[CreditRecord]) -> Result<u64, LoadError> {
        if self.load.mode == LoadMode::Transactional {
            sqlx::query(&delete_statement()).execute(&mut **tx).await.map_err(LoadError::Truncate)?;
            debug!("Deleted existing rows from {}", STAGING_TABLE);
        }

        let mut inserted = 0;
        for chunk in records.chunks(self.load.batch_size) {
            let result = insert_statement(chunk).build().execute(&mut **tx).await.map_err(LoadError::Insert)?;
            inserted += result.rows_affected();
            debug!("Inserted batch of {} rows", chunk.len());
        }

        Ok(inserted)
    }
}

#[async_trait]
impl CreditSink for MySqlSink {
    fn describe(&self) -> String {
        self.config.describe()
    }

    async fn check(&self) -> Result<(), LoadError> {
        let mut conn = self.connect().await?;
        let result = conn.ping().await.map_err(LoadError::Connect);
        Self::close(conn).await;
        result
    }

    async fn replace(&self, records: &[CreditRecord]) -> Result<u64, LoadError> {
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("MySQL connection error: {}", e);
                return Err(e);
            }
        };

        let result = self.replace_contents(&mut conn, records).await;
        Self::close(conn).await;

        match &result {
            Ok(inserted) => info!("Inserted Count : {}", inserted),
            Err(e) if leaves_table_empty(self.load.mode, e) => {
                error!("Load failed after TRUNCATE committed; {} is empty until the next run: {}", STAGING_TABLE, e)
            }
            Err(e) => error!("Load into {} failed: {}", STAGING_TABLE, e),
        }

        result
    }
}

/// Whether a failed replace has already committed the TRUNCATE
fn leaves_table_empty(mode: LoadMode, error: &LoadError) -> bool {
    mode == LoadMode::Truncate && matches!(error, LoadError::Begin(_) | LoadError::Insert(_) | LoadError::Commit(_))
}

async fn rollback(tx: Transaction<'_, MySql>) {
    match tx.rollback().await {
        Ok(()) => debug!("Rolled back staging table insert"),
        Err(e) => warn!("Rollback failed: {}", e),
    }
}

fn truncate_statement() -> String {
    format!("TRUNCATE TABLE {}", STAGING_TABLE)
}

fn delete_statement() -> String {
    format!("DELETE FROM {}", STAGING_TABLE)
}

/// Multi-row INSERT for one chunk of records
fn insert_statement(records: &[CreditRecord]) -> QueryBuilder<'static, MySql> {
    let mut builder =
        QueryBuilder::new(format!("INSERT INTO {} (h_jume, h_name, jumehuga, credit_amount) ", STAGING_TABLE));

    builder.push_values(records, |mut row, record| {
        row.push_bind(record.wholesaler_code.clone())
            .push_bind(record.wholesaler_name.clone())
            .push_bind(record.discount_rate)
            .push_bind(record.credit_amount);
    });

    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use rust_decimal::Decimal;

    fn record(code: &str, credit: i64) -> CreditRecord {
        CreditRecord::new(code, Some(format!("Wholesaler {}", code)), Some(Decimal::new(15, 1)), Decimal::from(credit))
    }

    #[test]
    fn test_insert_statement_has_one_tuple_per_record() {
        let records = vec![record("A", 10), record("B", -3)];
        let builder = insert_statement(&records);

        assert_eq!(
            builder.sql(),
            "INSERT INTO intermediate_wholesaler_credit (h_jume, h_name, jumehuga, credit_amount) \
             VALUES (?, ?, ?, ?), (?, ?, ?, ?)"
        );
    }

    #[test]
    fn test_clear_statements_target_staging_table() {
        assert_eq!(truncate_statement(), "TRUNCATE TABLE intermediate_wholesaler_credit");
        assert_eq!(delete_statement(), "DELETE FROM intermediate_wholesaler_credit");
    }

    #[test]
    fn test_only_post_truncate_failures_leave_table_empty() {
        let failure = || sqlx::Error::PoolClosed;

        assert!(leaves_table_empty(LoadMode::Truncate, &LoadError::Begin(failure())));
        assert!(leaves_table_empty(LoadMode::Truncate, &LoadError::Insert(failure())));
        assert!(leaves_table_empty(LoadMode::Truncate, &LoadError::Commit(failure())));
        assert!(!leaves_table_empty(LoadMode::Truncate, &LoadError::Connect(failure())));
        assert!(!leaves_table_empty(LoadMode::Truncate, &LoadError::Truncate(failure())));
        assert!(!leaves_table_empty(LoadMode::Transactional, &LoadError::Insert(failure())));
    }

    #[test]
    fn test_begin_failure_is_not_reported_as_insert() {
        let e = LoadError::Begin(sqlx::Error::PoolClosed);
        assert!(e.to_string().starts_with("failed to start staging table transaction"));
    }

    // The live tests below run against a real MySQL server described by
    // `TEST_MYSQL_*` variables: `cargo test -- --ignored`. They share the
    // staging table, so they take `LIVE_TABLE` for their whole body.
    static LIVE_TABLE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn live_sink(mode: LoadMode, batch_size: usize) -> MySqlSink {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        let config = MysqlConfig {
            host: var("TEST_MYSQL_HOST"),
            port: var("TEST_MYSQL_PORT").parse().unwrap_or(3306),
            user: var("TEST_MYSQL_USER"),
            password: Secret::new(var("TEST_MYSQL_PASSWORD")),
            database: var("TEST_MYSQL_DATABASE"),
            charset: "utf8mb4".to_string(),
        };
        MySqlSink::new(config, LoadConfig { mode, batch_size })
    }

    /// Recreate the staging table with a key so duplicate codes fail the insert
    async fn reset_table(sink: &MySqlSink) -> MySqlConnection {
        let mut conn = sink.connect().await.unwrap();
        sqlx::query("DROP TABLE IF EXISTS intermediate_wholesaler_credit").execute(&mut conn).await.unwrap();
        sqlx::query(
            "CREATE TABLE intermediate_wholesaler_credit (
                h_jume VARCHAR(20) PRIMARY KEY, h_name VARCHAR(100), jumehuga DECIMAL(10, 2),
                credit_amount DECIMAL(18, 2))",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        conn
    }

    async fn row_count(conn: &mut MySqlConnection) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM intermediate_wholesaler_credit").fetch_one(conn).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server"]
    async fn test_replace_is_a_full_refresh() {
        let _table = LIVE_TABLE.lock().unwrap_or_else(|e| e.into_inner());
        let sink = live_sink(LoadMode::Truncate, 2);
        let mut conn = reset_table(&sink).await;

        let records = vec![record("A", 10), record("B", -3), record("C", 0)];
        assert_eq!(sink.replace(&records).await.unwrap(), 3);
        assert_eq!(sink.replace(&records).await.unwrap(), 3);
        assert_eq!(row_count(&mut conn).await, 3);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server"]
    async fn test_replace_splits_rows_into_batches() {
        let _table = LIVE_TABLE.lock().unwrap_or_else(|e| e.into_inner());
        let sink = live_sink(LoadMode::Truncate, 2);
        let mut conn = reset_table(&sink).await;

        let records: Vec<_> = ["A", "B", "C", "D", "E"].iter().map(|code| record(code, 1)).collect();
        assert_eq!(sink.replace(&records).await.unwrap(), 5);
        assert_eq!(row_count(&mut conn).await, 5);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server"]
    async fn test_truncate_mode_insert_failure_leaves_table_empty() {
        let _table = LIVE_TABLE.lock().unwrap_or_else(|e| e.into_inner());
        let sink = live_sink(LoadMode::Truncate, 2);
        let mut conn = reset_table(&sink).await;
        sink.replace(&[record("A", 10), record("B", 20)]).await.unwrap();

        // The second batch repeats a key, so the first batch is rolled back too
        let duplicate = vec![record("X", 1), record("Y", 2), record("X", 3)];
        let result = sink.replace(&duplicate).await;

        assert!(matches!(result, Err(LoadError::Insert(_))));
        assert_eq!(row_count(&mut conn).await, 0);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server"]
    async fn test_transactional_mode_insert_failure_keeps_previous_rows() {
        let _table = LIVE_TABLE.lock().unwrap_or_else(|e| e.into_inner());
        let sink = live_sink(LoadMode::Transactional, 2);
        let mut conn = reset_table(&sink).await;
        sink.replace(&[record("A", 10), record("B", 20), record("C", 30)]).await.unwrap();

        let duplicate = vec![record("X", 1), record("Y", 2), record("X", 3)];
        let result = sink.replace(&duplicate).await;

        assert!(matches!(result, Err(LoadError::Insert(_))));
        assert_eq!(row_count(&mut conn).await, 3);

        conn.close().await.unwrap();
    }
}
