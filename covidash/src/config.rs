use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::query::DateRange;

/// Environment variable that overrides the warehouse token from the config file.
pub const WAREHOUSE_TOKEN_ENV: &str = "COVIDASH_WAREHOUSE_TOKEN";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub report: ReportConfig,
    pub comments: CommentsConfig,
    pub server: ServerConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WarehouseConfig {
    pub source: WarehouseSource,
    /// Upper bound on concurrently executing queries.
    pub pool_size: usize,
    pub query_timeout_secs: u64,
}

impl WarehouseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            source: WarehouseSource::default(),
            pool_size: 4,
            query_timeout_secs: 30,
        }
    }
}

/// Where queries are executed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WarehouseSource {
    /// A remote warehouse reached through its HTTP SQL statements API.
    SqlApi(SqlApiConfig),
    /// Parquet exports of the warehouse tables queried in-process.
    Parquet {
        extended_path: PathBuf,
        metadata_path: Option<PathBuf>,
    },
}

impl Default for WarehouseSource {
    fn default() -> Self {
        Self::Parquet {
            extended_path: "data/united_global_extended.parquet".into(),
            metadata_path: Some("data/united_global_metadata.parquet".into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct SqlApiConfig {
    pub endpoint: String,
    pub account: String,
    pub user: String,
    /// Bearer token; prefer setting `COVIDASH_WAREHOUSE_TOKEN` over storing it here.
    pub token: String,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    pub role: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub focus_country: String,
    pub cluster_date: NaiveDate,
    pub cluster_count: usize,
}

impl ReportConfig {
    pub fn range(&self) -> crate::error::Result<DateRange> {
        DateRange::new(self.start, self.end)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        // Unwrap: constant dates are valid
        Self {
            start: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2021, 12, 31).unwrap(),
            focus_country: "Latvia".into(),
            cluster_date: NaiveDate::from_ymd_opt(2021, 12, 1).unwrap(),
            cluster_count: crate::cluster::DEFAULT_CLUSTER_COUNT,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct CommentsConfig {
    /// JSON-lines file for comments. Comments are kept in memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            request_timeout_secs: 60,
        }
    }
}
