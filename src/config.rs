//! Configuration loader and validator for OData→SQL job files.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub global_config: GlobalConfig,
    pub tables: BTreeMap<String, TableJob>,
}

/// Pagination strategy the feed supports.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// One request per planned date window.
    #[default]
    Windowed,
    /// Follow server-provided `rel=next` links until exhausted.
    LinkFollowing,
}

/// Service- and storage-level settings shared by every table in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalConfig {
    pub base_url: String,
    pub api_login: String,
    pub api_pwd: String,
    pub ms_sql_db_host: String,
    pub ms_sql_db: String,
    pub ms_sql_db_user: String,
    pub ms_sql_db_pass: String,
    #[serde(default)]
    pub log_mode: String,
    /// When true the feed is queried as JSON; otherwise as Atom markup.
    #[serde(default)]
    pub json_allowed: bool,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub feed_mode: FeedMode,
}

fn default_request_timeout() -> u64 {
    60
}

/// How rows are purged before re-inserting a table's data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DateMode {
    Full,
    Period,
}

/// One configured entity: the request to send and its date-windowing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableJob {
    pub data_request: String,
    /// Fallback request used after a destructive table rebuild.
    #[serde(default)]
    pub full_data_request: Option<String>,
    pub date_mode: DateMode,
    #[serde(default)]
    pub date_field: Option<String>,
    /// Window span token, e.g. `5d`, `2w`, `1m`, `1y`.
    #[serde(default = "default_date_inc")]
    pub date_inc: String,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default)]
    pub date_from_full: Option<String>,
    #[serde(default)]
    pub date_to_full: Option<String>,
    /// Clustered index fields for the target table.
    #[serde(default)]
    pub indexes: Vec<String>,
}

fn default_date_inc() -> String {
    "1d".to_string()
}

impl GlobalConfig {
    /// Base URL with a guaranteed trailing slash.
    pub fn normalized_base_url(&self) -> String {
        let trimmed = self.base_url.trim();
        if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.log_mode.trim().eq_ignore_ascii_case("verbose")
    }

    /// Database URL for the SQL executor.
    pub fn database_url(&self) -> String {
        format!(
            "mssql://{}:{}@{}/{}",
            self.ms_sql_db_user, self.ms_sql_db_pass, self.ms_sql_db_host, self.ms_sql_db
        )
    }
}

/// Load configuration from a YAML job file and validate it.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let g = &cfg.global_config;
    if g.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("global_config.base_url must be non-empty"));
    }
    if g.api_login.trim().is_empty() {
        return Err(ConfigError::Invalid("global_config.api_login must be non-empty"));
    }
    if g.ms_sql_db_host.trim().is_empty() {
        return Err(ConfigError::Invalid("global_config.ms_sql_db_host must be non-empty"));
    }
    if g.ms_sql_db.trim().is_empty() {
        return Err(ConfigError::Invalid("global_config.ms_sql_db must be non-empty"));
    }
    if g.ms_sql_db_user.trim().is_empty() {
        return Err(ConfigError::Invalid("global_config.ms_sql_db_user must be non-empty"));
    }
    if g.request_timeout == 0 {
        return Err(ConfigError::Invalid("global_config.request_timeout must be > 0"));
    }

    if cfg.tables.is_empty() {
        return Err(ConfigError::Invalid("tables must contain at least one entry"));
    }
    for job in cfg.tables.values() {
        if job.data_request.trim().is_empty() {
            return Err(ConfigError::Invalid("tables.*.data_request must be non-empty"));
        }
        if crate::windows::parse_increment(&job.date_inc).is_none() {
            return Err(ConfigError::Invalid(
                "tables.*.date_inc must look like `<n><d|w|m|y>`",
            ));
        }
    }

    Ok(())
}

/// Returns an example YAML job file.
pub fn example() -> &'static str {
    r#"global_config:
  base_url: "https://erp.example.com/odata/standard.odata"
  api_login: "loader"
  api_pwd: "SECRET"
  ms_sql_db_host: "sql.example.com"
  ms_sql_db: "staging"
  ms_sql_db_user: "etl"
  ms_sql_db_pass: "SECRET"
  log_mode: "verbose"
  json_allowed: true
  request_timeout: 60
  feed_mode: "windowed"

tables:
  orders:
    data_request: "Document_Order?$filter=Date ge datetime'#STARTDATE#' and Date le datetime'#FINISHDATE#'"
    full_data_request: "Document_Order"
    date_mode: "period"
    date_field: "Date"
    date_inc: "5d"
    date_from: "2024-01-01"
    date_to: "2024-01-10"
    date_from_full: "2020-01-01"
    date_to_full: "2024-12-31"
    indexes:
      - "Ref_Key"
"#
}
