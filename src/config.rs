/// Configuration Module
///
/// Builds the validated job configuration once at startup. Values come from a
/// key lookup (process environment, `.env`, CLI overrides) so that the stages
/// only ever see the resulting `Config` and never read the environment.
use clap::ValueEnum;
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

const DEFAULT_MSSQL_PORT: u16 = 1433;
const DEFAULT_MSSQL_CHARSET: &str = "cp949";
const DEFAULT_MYSQL_PORT: u16 = 3306;
const DEFAULT_MYSQL_CHARSET: &str = "utf8mb4";
const DEFAULT_BATCH_SIZE: usize = 1000;
/// MySQL allows at most 65535 placeholders per statement; each row binds 4
pub const MAX_BATCH_SIZE: usize = 65535 / 4;
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_PREFIX: &str = "credit-sync";

/// Configuration errors, reported before any connection is attempted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

/// A credential that must not end up in logs
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// How the source store is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceDriver {
    /// Native TDS protocol to SQL Server
    Tds,
    /// Generic connector addressed by a connection URL
    Generic,
}

/// How the staging table is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LoadMode {
    /// TRUNCATE (auto-committed), then insert in its own transaction
    #[default]
    Truncate,
    /// DELETE and insert in a single transaction
    Transactional,
}

/// SQL Server connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MssqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub database: String,
    /// Expected server code page. The TDS driver decodes text by column
    /// collation, so this is only checked and logged.
    pub charset: String,
    pub encrypt: bool,
    pub trust_server_certificate: bool,
    pub login_timeout: Option<Duration>,
    pub query_timeout: Option<Duration>,
}

impl MssqlConfig {
    pub fn describe(&self) -> String {
        format!("mssql://{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

/// Generic connector parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericSourceConfig {
    pub url: Secret,
    pub query_timeout: Option<Duration>,
}

impl GenericSourceConfig {
    /// Driver scheme only; the URL may carry credentials
    pub fn describe(&self) -> String {
        let scheme = self.url.expose().split(':').next().unwrap_or("unknown");
        format!("generic ({})", scheme)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Tds(MssqlConfig),
    Generic(GenericSourceConfig),
}

impl SourceConfig {
    pub fn describe(&self) -> String {
        match self {
            Self::Tds(cfg) => cfg.describe(),
            Self::Generic(cfg) => cfg.describe(),
        }
    }
}

/// MySQL connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub database: String,
    pub charset: String,
}

impl MysqlConfig {
    pub fn describe(&self) -> String {
        format!("mysql://{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadConfig {
    pub mode: LoadMode,
    /// Rows per INSERT statement; every statement shares one transaction
    pub batch_size: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self { mode: LoadMode::default(), batch_size: DEFAULT_BATCH_SIZE }
    }
}

/// Log sink parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
}

impl LogConfig {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        Self {
            dir: vars.get("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            file_prefix: vars.get("LOG_FILE_PREFIX").unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string()),
        }
    }
}

/// Complete job configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: MysqlConfig,
    pub load: LoadConfig,
}

impl Config {
    /// Build and validate the configuration from a key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let driver = match vars.get("SOURCE_DRIVER") {
            Some(value) => parse_enum::<SourceDriver>("SOURCE_DRIVER", &value)?,
            None => SourceDriver::Tds,
        };

        let source = match driver {
            SourceDriver::Tds => SourceConfig::Tds(MssqlConfig {
                host: vars.required("MSSQL_SERVER")?,
                port: vars.parse_or("MSSQL_PORT", DEFAULT_MSSQL_PORT)?,
                user: vars.required("MSSQL_USER")?,
                password: Secret::new(vars.get("MSSQL_PASSWORD").unwrap_or_default()),
                database: vars.required("MSSQL_DATABASE")?,
                charset: vars.get("MSSQL_CHARSET").unwrap_or_else(|| DEFAULT_MSSQL_CHARSET.to_string()),
                encrypt: vars.flag("MSSQL_ENCRYPT", false)?,
                trust_server_certificate: vars.flag("MSSQL_TRUST_SERVER_CERTIFICATE", false)?,
                login_timeout: vars.seconds("MSSQL_LOGIN_TIMEOUT")?,
                query_timeout: vars.seconds("MSSQL_QUERY_TIMEOUT")?,
            }),
            SourceDriver::Generic => SourceConfig::Generic(GenericSourceConfig {
                url: Secret::new(vars.required("SOURCE_URL")?),
                query_timeout: vars.seconds("SOURCE_QUERY_TIMEOUT")?,
            }),
        };

        let charset = vars.get("MYSQL_CHARSET").unwrap_or_else(|| DEFAULT_MYSQL_CHARSET.to_string());
        if !charset.to_ascii_lowercase().starts_with("utf8") {
            return Err(ConfigError::Invalid {
                key: "MYSQL_CHARSET",
                value: charset,
                reason: "destination charset must be utf8 or utf8mb4".to_string(),
            });
        }

        let destination = MysqlConfig {
            host: vars.required("MYSQL_HOST")?,
            port: vars.parse_or("MYSQL_PORT", DEFAULT_MYSQL_PORT)?,
            user: vars.required("MYSQL_USER")?,
            password: Secret::new(vars.get("MYSQL_PASSWORD").unwrap_or_default()),
            database: vars.required("MYSQL_DATABASE")?,
            charset,
        };

        let mode = match vars.get("LOAD_MODE") {
            Some(value) => parse_enum::<LoadMode>("LOAD_MODE", &value)?,
            None => LoadMode::default(),
        };
        let batch_size = vars.parse_or("LOAD_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(ConfigError::Invalid {
                key: "LOAD_BATCH_SIZE",
                value: batch_size.to_string(),
                reason: format!("must be between 1 and {}", MAX_BATCH_SIZE),
            });
        }

        Ok(Self { source, destination, load: LoadConfig { mode, batch_size } })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };

        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value, reason: "expected a boolean".to_string() }),
        }
    }

    /// Whole seconds; zero disables the timeout
    fn seconds(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        let secs: u64 = self.parse_or(key, 0)?;
        Ok((secs > 0).then(|| Duration::from_secs(secs)))
    }
}

fn parse_enum<T: ValueEnum>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    <T as ValueEnum>::from_str(value, true).map_err(|reason| ConfigError::Invalid { key, value: value.to_string(), reason })
}
