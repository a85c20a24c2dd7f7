/// Extract Module
///
/// Reads wholesaler credit records from the source store. Two drivers sit
/// behind `CreditSource`:
/// - `TdsSource`: native TDS protocol to SQL Server (tiberius)
/// - `GenericSource`: any store sqlx can reach from a connection URL
///
/// Both run the same fixed query. The remaining credit is computed by the
/// query itself, with missing limits and balances counted as zero.
use crate::config::{GenericSourceConfig, MssqlConfig, SourceConfig};
use crate::etl::{CreditSource, FetchError};
use crate::models::CreditRecord;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{any::AnyRow, AnyConnection, Connection, Row};
use std::{future::Future, time::Duration};
use tiberius::{AuthMethod, Client, ColumnData, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, error, info, warn};

/// Wholesaler code, name, discount rate and remaining credit for every
/// wholesaler present in all three tables
pub const SOURCE_QUERY: &str = r#"
    SELECT h.h_jume
        , h.h_name
        , s.jumehuga
        , (COALESCE(h.h_limit, 0) - COALESCE(j.jm_misu, 0)) AS credit_amount
    FROM hando AS h
        , jumemisu AS j
        , sajumecode AS s
    WHERE h.h_jume = j.jm_code
        AND j.jm_code = s.jumecode
"#;

const COLUMNS: [&str; 4] = ["h_jume", "h_name", "jumehuga", "credit_amount"];

/// Build the configured source driver
pub fn build_source(config: &SourceConfig) -> Box<dyn CreditSource> {
    match config {
        SourceConfig::Tds(cfg) => Box::new(TdsSource::new(cfg.clone())),
        SourceConfig::Generic(cfg) => Box::new(GenericSource::new(cfg.clone())),
    }
}

/// Await `fut`, failing with `FetchError::Timeout` once `limit` elapses
async fn with_timeout<T>(
    limit: Option<Duration>,
    stage: &'static str,
    fut: impl Future<Output = T>,
) -> Result<T, FetchError> {
    match limit {
        Some(after) => tokio::time::timeout(after, fut).await.map_err(|_| FetchError::Timeout { stage, after }),
        None => Ok(fut.await),
    }
}

fn decode_error(row: usize, column: usize, reason: impl ToString) -> FetchError {
    FetchError::Decode { row, column: COLUMNS[column], reason: reason.to_string() }
}

// ---------------------------------------------------------------------------
// TDS (SQL Server)
// ---------------------------------------------------------------------------

type TdsClient = Client<Compat<TcpStream>>;

pub struct TdsSource {
    config: MssqlConfig,
}

impl TdsSource {
    pub fn new(config: MssqlConfig) -> Self {
        Self { config }
    }

    fn tds_config(&self) -> tiberius::Config {
        let mut config = tiberius::Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, self.config.password.expose()));
        config.application_name(env!("CARGO_PKG_NAME"));

        if self.config.encrypt {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        if self.config.trust_server_certificate {
            config.trust_cert();
        }

        config
    }

    async fn connect(&self) -> Result<TdsClient, FetchError> {
        let config = self.tds_config();
        debug!(
            "Connecting to {} (charset {}, encrypt {})",
            self.config.describe(),
            self.config.charset,
            self.config.encrypt
        );

        let connect = async {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Client::connect(config, tcp.compat_write()).await
        };

        with_timeout(self.config.login_timeout, "login", connect)
            .await?
            .map_err(|e| FetchError::Connect(Box::new(e)))
    }

    async fn query(&self, client: &mut TdsClient) -> Result<Vec<CreditRecord>, FetchError> {
        let rows = with_timeout(self.config.query_timeout, "query", async {
            client.simple_query(SOURCE_QUERY).await?.into_first_result().await
        })
        .await?
        .map_err(|e| FetchError::Query(Box::new(e)))?;

        rows.iter().enumerate().map(|(index, row)| decode_tds_row(index, row)).collect()
    }

    async fn close(client: TdsClient) {
        if let Err(e) = client.close().await {
            warn!("Failed to close MSSQL connection cleanly: {}", e);
        }
    }
}

#[async_trait]
impl CreditSource for TdsSource {
    fn describe(&self) -> String {
        self.config.describe()
    }

    async fn check(&self) -> Result<(), FetchError> {
        let mut client = self.connect().await?;
        let result = with_timeout(self.config.query_timeout, "query", async {
            client.simple_query("SELECT 1").await?.into_row().await
        })
        .await
        .and_then(|r| r.map(|_| ()).map_err(|e| FetchError::Query(Box::new(e))));
        Self::close(client).await;
        result
    }

    async fn fetch(&self) -> Result<Vec<CreditRecord>, FetchError> {
        let mut client = match self.connect().await {
            Ok(client) => client,
            Err(e) => {
                error!("MSSQL connection error: {}", e);
                return Err(e);
            }
        };

        let result = self.query(&mut client).await;
        Self::close(client).await;

        match &result {
            Ok(records) => info!("Fetched {} credit records from {}", records.len(), self.describe()),
            Err(e @ FetchError::Decode { .. }) => error!("Unexpected error reading MSSQL rows: {}", e),
            Err(e) => error!("MSSQL database error: {}", e),
        }

        result
    }
}

fn decode_tds_row(index: usize, row: &tiberius::Row) -> Result<CreditRecord, FetchError> {
    let code = tds_text(row, 0)
        .map_err(|e| decode_error(index, 0, e))?
        .ok_or_else(|| decode_error(index, 0, "unexpected NULL"))?;
    let name = tds_text(row, 1).map_err(|e| decode_error(index, 1, e))?;
    let rate = tds_decimal(row, 2).map_err(|e| decode_error(index, 2, e))?;
    let credit = tds_decimal(row, 3).map_err(|e| decode_error(index, 3, e))?.unwrap_or_default();

    Ok(CreditRecord::new(code, name, rate, credit))
}

fn tds_cell<'a>(row: &'a tiberius::Row, idx: usize) -> Result<&'a ColumnData<'static>, String> {
    row.cells().nth(idx).map(|(_, data)| data).ok_or_else(|| format!("row has no column {}", idx))
}

fn tds_text(row: &tiberius::Row, idx: usize) -> Result<Option<String>, String> {
    column_text(tds_cell(row, idx)?)
}

fn tds_decimal(row: &tiberius::Row, idx: usize) -> Result<Option<Decimal>, String> {
    column_decimal(tds_cell(row, idx)?)
}

/// Character columns, or integer codes rendered as text
fn column_text(data: &ColumnData<'_>) -> Result<Option<String>, String> {
    match data {
        ColumnData::String(value) => Ok(value.as_ref().map(|v| v.to_string())),
        ColumnData::U8(value) => Ok(value.map(|v| v.to_string())),
        ColumnData::I16(value) => Ok(value.map(|v| v.to_string())),
        ColumnData::I32(value) => Ok(value.map(|v| v.to_string())),
        ColumnData::I64(value) => Ok(value.map(|v| v.to_string())),
        other => Err(format!("unsupported text column {:?}", other)),
    }
}

/// Any numeric SQL Server column as an exact decimal. `tinyint` arrives as
/// `U8`, `smallint` as `I16`, and `money` as `F64`.
fn column_decimal(data: &ColumnData<'_>) -> Result<Option<Decimal>, String> {
    match data {
        ColumnData::Numeric(value) => value
            .as_ref()
            .map(|n| Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale())))
            .transpose()
            .map_err(|e| e.to_string()),
        ColumnData::U8(value) => Ok(value.map(Decimal::from)),
        ColumnData::I16(value) => Ok(value.map(Decimal::from)),
        ColumnData::I32(value) => Ok(value.map(Decimal::from)),
        ColumnData::I64(value) => Ok(value.map(Decimal::from)),
        ColumnData::F32(value) => value.map(Decimal::try_from).transpose().map_err(|e| e.to_string()),
        ColumnData::F64(value) => value.map(Decimal::try_from).transpose().map_err(|e| e.to_string()),
        other => Err(format!("unsupported numeric column {:?}", other)),
    }
}

// ---------------------------------------------------------------------------
// Generic connector (sqlx::any)
// ---------------------------------------------------------------------------

pub struct GenericSource {
    config: GenericSourceConfig,
}

impl GenericSource {
    pub fn new(config: GenericSourceConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<AnyConnection, FetchError> {
        sqlx::any::install_default_drivers();

        AnyConnection::connect(self.config.url.expose()).await.map_err(|e| FetchError::Connect(Box::new(e)))
    }

    async fn query(&self, conn: &mut AnyConnection) -> Result<Vec<CreditRecord>, FetchError> {
        let rows = with_timeout(self.config.query_timeout, "query", sqlx::query(SOURCE_QUERY).fetch_all(&mut *conn))
            .await?
            .map_err(|e| FetchError::Query(Box::new(e)))?;

        rows.iter().enumerate().map(|(index, row)| decode_any_row(index, row)).collect()
    }

    async fn close(conn: AnyConnection) {
        if let Err(e) = conn.close().await {
            warn!("Failed to close source connection cleanly: {}", e);
        }
    }
}

#[async_trait]
impl CreditSource for GenericSource {
    fn describe(&self) -> String {
        self.config.describe()
    }

    async fn check(&self) -> Result<(), FetchError> {
        let mut conn = self.connect().await?;
        let result = with_timeout(self.config.query_timeout, "query", sqlx::query("SELECT 1").execute(&mut conn))
            .await
            .and_then(|r| r.map(|_| ()).map_err(|e| FetchError::Query(Box::new(e))));
        Self::close(conn).await;
        result
    }

    async fn fetch(&self) -> Result<Vec<CreditRecord>, FetchError> {
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Source connection error: {}", e);
                return Err(e);
            }
        };

        let result = self.query(&mut conn).await;
        Self::close(conn).await;

        match &result {
            Ok(records) => info!("Fetched {} credit records from {}", records.len(), self.describe()),
            Err(e @ FetchError::Decode { .. }) => error!("Unexpected error reading source rows: {}", e),
            Err(e) => error!("Source database error: {}", e),
        }

        result
    }
}

fn decode_any_row(index: usize, row: &AnyRow) -> Result<CreditRecord, FetchError> {
    let code = any_text(row, 0)
        .map_err(|e| decode_error(index, 0, e))?
        .ok_or_else(|| decode_error(index, 0, "unexpected NULL"))?;
    let name = any_text(row, 1).map_err(|e| decode_error(index, 1, e))?;
    let rate = any_decimal(row, 2).map_err(|e| decode_error(index, 2, e))?;
    let credit = any_decimal(row, 3).map_err(|e| decode_error(index, 3, e))?.unwrap_or_default();

    Ok(CreditRecord::new(code, name, rate, credit))
}

fn any_text(row: &AnyRow, idx: usize) -> Result<Option<String>, sqlx::Error> {
    if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
        return Ok(value);
    }
    row.try_get::<Option<i64>, _>(idx).map(|value| value.map(|v| v.to_string()))
}

/// The generic connector only carries integers and doubles for numerics
fn any_decimal(row: &AnyRow, idx: usize) -> Result<Option<Decimal>, String> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(value.map(Decimal::from));
    }
    match row.try_get::<Option<f64>, _>(idx) {
        Ok(value) => value.map(Decimal::try_from).transpose().map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}
