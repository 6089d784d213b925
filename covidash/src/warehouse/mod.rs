//! The warehouse collaborator: runs a [`Query`] and hands back typed rows.
//!
//! Implementations own their connection lifecycle. [`WarehousePool`] bounds how many queries
//! run at once, holding one permit ("connection") per executing query.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, info};
use polars::prelude::AnyValue;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::{WarehouseConfig, WarehouseSource, WAREHOUSE_TOKEN_ENV};
use crate::error::{CovidashError, Result};
use crate::query::{Query, DATE_FORMAT};

pub mod frame;
pub mod sql_api;

pub use frame::FrameWarehouse;
pub use sql_api::SqlApiWarehouse;

/// Days from 0001-01-01 (CE day 1) to the unix epoch.
pub(crate) const EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// A single typed cell of a warehouse row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(n) => Some(*n as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn from_epoch_days(days: i32) -> Result<Self> {
        NaiveDate::from_num_days_from_ce_opt(days + EPOCH_DAYS_FROM_CE)
            .map(Scalar::Date)
            .ok_or_else(|| CovidashError::DataIntegrity(format!("date out of range: {days}")))
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Null => Ok(()),
            Scalar::Int(n) => write!(f, "{n}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(s) => f.write_str(s),
            Scalar::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

impl TryFrom<AnyValue<'_>> for Scalar {
    type Error = CovidashError;

    fn try_from(value: AnyValue<'_>) -> Result<Self> {
        Ok(match value {
            AnyValue::Null => Scalar::Null,
            AnyValue::Boolean(b) => Scalar::Int(b.into()),
            AnyValue::Int8(n) => Scalar::Int(n.into()),
            AnyValue::Int16(n) => Scalar::Int(n.into()),
            AnyValue::Int32(n) => Scalar::Int(n.into()),
            AnyValue::Int64(n) => Scalar::Int(n),
            AnyValue::UInt8(n) => Scalar::Int(n.into()),
            AnyValue::UInt16(n) => Scalar::Int(n.into()),
            AnyValue::UInt32(n) => Scalar::Int(n.into()),
            AnyValue::UInt64(n) => Scalar::Int(i64::try_from(n).map_err(|_| {
                CovidashError::DataIntegrity(format!("integer out of range: {n}"))
            })?),
            AnyValue::Float32(f) => Scalar::Float(f.into()),
            AnyValue::Float64(f) => Scalar::Float(f),
            AnyValue::Date(days) => Scalar::from_epoch_days(days)?,
            other => match other.get_str() {
                Some(s) => Scalar::Text(s.to_string()),
                None => {
                    return Err(CovidashError::DataIntegrity(format!(
                        "unsupported value type: {}",
                        other.dtype()
                    )))
                }
            },
        })
    }
}

/// Rows returned by a warehouse, each a fixed-arity tuple matching `columns`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run a query with its bound parameters. Connection or execution faults are reported as
    /// `ServiceUnavailable`.
    async fn execute(&self, query: &Query) -> Result<RowSet>;
}

/// Bounded pool of warehouse connections shared by the queries of a report.
#[derive(Clone)]
pub struct WarehousePool {
    warehouse: Arc<dyn Warehouse>,
    connections: Arc<Semaphore>,
    size: usize,
    query_timeout: Duration,
}

impl WarehousePool {
    pub fn new(warehouse: Arc<dyn Warehouse>, size: usize, query_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            warehouse,
            connections: Arc::new(Semaphore::new(size)),
            size,
            query_timeout,
        }
    }

    /// Acquire a connection, run the query, release the connection. The timeout covers both
    /// waiting for a connection and running the query. The permit is dropped on every exit path
    /// including timeouts and errors.
    pub async fn execute(&self, query: &Query) -> Result<RowSet> {
        tokio::time::timeout(self.query_timeout, async {
            let _connection = self.connections.acquire().await.map_err(|_| {
                CovidashError::ServiceUnavailable("warehouse pool is closed".into())
            })?;
            debug!("executing `{}` with {:?}", query.sql(), query.params());
            self.warehouse.execute(query).await
        })
        .await?
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections not currently held by a query.
    pub fn available(&self) -> usize {
        self.connections.available_permits()
    }

    /// Stop handing out connections. Queries already running finish normally.
    pub fn close(&self) {
        info!("closing warehouse pool");
        self.connections.close();
    }
}

/// Build the warehouse configured in `config`.
pub async fn connect(config: &WarehouseConfig) -> Result<Arc<dyn Warehouse>> {
    match &config.source {
        WarehouseSource::SqlApi(api) => {
            let mut api = api.clone();
            if let Ok(token) = std::env::var(WAREHOUSE_TOKEN_ENV) {
                api.token = token;
            }
            info!("using SQL API warehouse at {}", api.endpoint);
            Ok(Arc::new(SqlApiWarehouse::new(api, config.query_timeout())?))
        }
        WarehouseSource::Parquet {
            extended_path,
            metadata_path,
        } => {
            let extended_path = extended_path.clone();
            let metadata_path = metadata_path.clone();
            // Required because polars is blocking
            let warehouse = tokio::task::spawn_blocking(move || {
                FrameWarehouse::from_parquet(&extended_path, metadata_path.as_deref())
            })
            .await
            .map_err(|e| CovidashError::ServiceUnavailable(format!("loading tables failed: {e}")))??;
            Ok(Arc::new(warehouse))
        }
    }
}
