//! Warehouse reached through an HTTP SQL statements API (Snowflake style).
//!
//! Every statement is sent with its bound values as positional `bindings`; the statement text
//! itself only ever contains `?` placeholders.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{RowSet, Scalar, Warehouse};
use crate::config::SqlApiConfig;
use crate::error::{CovidashError, Result};
use crate::query::{Param, Query, DATE_FORMAT};
use crate::COL;

const STATEMENTS_PATH: &str = "/api/v2/statements";

#[derive(Serialize, Debug)]
struct Binding {
    #[serde(rename = "type")]
    kind: &'static str,
    value: String,
}

impl From<&Param> for Binding {
    fn from(param: &Param) -> Self {
        // Dates are bound as ISO text and cast by the warehouse on comparison
        Binding {
            kind: "TEXT",
            value: param.to_string(),
        }
    }
}

#[derive(Serialize, Debug)]
struct StatementRequest<'a> {
    statement: String,
    timeout: u64,
    warehouse: &'a str,
    database: &'a str,
    schema: &'a str,
    role: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    bindings: BTreeMap<String, Binding>,
}

type RawRows = Vec<Vec<Option<String>>>;

/// The first response of a statement. It carries partition 0 inline; any further partitions
/// are fetched by statement handle.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    result_set_meta_data: ResultSetMetaData,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    data: RawRows,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<PartitionInfo>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PartitionInfo {
    row_count: usize,
}

#[derive(Deserialize, Debug)]
struct PartitionResponse {
    #[serde(default)]
    data: RawRows,
}

#[derive(Deserialize, Debug)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    scale: Option<i64>,
}

impl RowType {
    fn decode(&self, value: Option<&str>) -> Result<Scalar> {
        let Some(value) = value else {
            return Ok(Scalar::Null);
        };
        let malformed =
            || CovidashError::DataIntegrity(format!("malformed {} value for {}: {value}", self.kind, self.name));
        Ok(match self.kind.to_ascii_lowercase().as_str() {
            "fixed" if self.scale.unwrap_or(0) == 0 => {
                Scalar::Int(value.parse().map_err(|_| malformed())?)
            }
            "fixed" | "real" => Scalar::Float(value.parse().map_err(|_| malformed())?),
            "boolean" => Scalar::Int(i64::from(value.eq_ignore_ascii_case("true"))),
            // Dates arrive as days since the epoch
            "date" => match value.parse::<i32>() {
                Ok(days) => Scalar::from_epoch_days(days)?,
                Err(_) => Scalar::Date(
                    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| malformed())?,
                ),
            },
            _ => Scalar::Text(value.to_string()),
        })
    }
}

pub struct SqlApiWarehouse {
    client: reqwest::Client,
    config: SqlApiConfig,
    statement_timeout: Duration,
}

impl SqlApiWarehouse {
    pub fn new(config: SqlApiConfig, statement_timeout: Duration) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(CovidashError::ServiceUnavailable(
                "no SQL API endpoint configured".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(statement_timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            statement_timeout,
        })
    }

    fn request<'a>(&'a self, query: &Query) -> StatementRequest<'a> {
        StatementRequest {
            statement: query.sql(),
            timeout: self.statement_timeout.as_secs(),
            warehouse: &self.config.warehouse,
            database: &self.config.database,
            schema: &self.config.schema,
            role: &self.config.role,
            bindings: query
                .params()
                .iter()
                .enumerate()
                .map(|(idx, param)| ((idx + 1).to_string(), Binding::from(param)))
                .collect(),
        }
    }
}

/// Keep only the columns `DESCRIBE TABLE` is expected to produce.
fn project_describe(rows: RowSet) -> Result<RowSet> {
    let indices = [COL::DESCRIBE_NAME, COL::DESCRIBE_TYPE]
        .iter()
        .map(|wanted| {
            rows.columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(wanted))
                .ok_or_else(|| {
                    CovidashError::DataIntegrity(format!("DESCRIBE result has no '{wanted}' column"))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(RowSet {
        columns: vec![COL::DESCRIBE_NAME.into(), COL::DESCRIBE_TYPE.into()],
        rows: rows
            .rows
            .into_iter()
            .map(|row| indices.iter().map(|&i| row.get(i).cloned().unwrap_or(Scalar::Null)).collect())
            .collect(),
    })
}

/// Send a request and turn incomplete or failed statements into errors.
async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;
    let status = response.status();
    if status == reqwest::StatusCode::ACCEPTED {
        return Err(CovidashError::ServiceUnavailable(
            "statement did not complete within the timeout".into(),
        ));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("warehouse rejected statement with {status}: {body}");
        return Err(CovidashError::ServiceUnavailable(format!(
            "warehouse returned {status}"
        )));
    }
    Ok(response)
}

impl SqlApiWarehouse {
    fn statements_url(&self) -> String {
        format!("{}{STATEMENTS_PATH}", self.config.endpoint.trim_end_matches('/'))
    }

    /// Rows of every partition of the result, in partition order.
    async fn all_partitions(&self, body: &mut StatementResponse) -> Result<RawRows> {
        let partitions = &body.result_set_meta_data.partition_info;
        let mut data = std::mem::take(&mut body.data);
        if partitions.len() <= 1 {
            return Ok(data);
        }
        let handle = body.statement_handle.as_deref().ok_or_else(|| {
            CovidashError::DataIntegrity(format!(
                "result has {} partitions but no statement handle",
                partitions.len()
            ))
        })?;
        let url = format!("{}/{handle}", self.statements_url());
        for (partition, info) in partitions.iter().enumerate().skip(1) {
            debug!("GET {url} partition {partition}");
            let response = send(
                self.client
                    .get(&url)
                    .bearer_auth(&self.config.token)
                    .query(&[("partition", partition)]),
            )
            .await?;
            let rows = response.json::<PartitionResponse>().await?.data;
            if rows.len() != info.row_count {
                return Err(CovidashError::DataIntegrity(format!(
                    "partition {partition} has {} rows, expected {}",
                    rows.len(),
                    info.row_count
                )));
            }
            data.extend(rows);
        }
        Ok(data)
    }
}

#[async_trait]
impl Warehouse for SqlApiWarehouse {
    async fn execute(&self, query: &Query) -> Result<RowSet> {
        let url = self.statements_url();
        debug!("POST {url} as {}@{}", self.config.user, self.config.account);
        let response = send(
            self.client
                .post(&url)
                .bearer_auth(&self.config.token)
                .json(&self.request(query)),
        )
        .await?;

        let mut body: StatementResponse = response.json().await?;
        let data = self.all_partitions(&mut body).await?;
        let row_types = body.result_set_meta_data.row_type;
        let rows = data
            .iter()
            .map(|row| {
                if row.len() != row_types.len() {
                    return Err(CovidashError::DataIntegrity(format!(
                        "row has {} values but the result declares {} columns",
                        row.len(),
                        row_types.len()
                    )));
                }
                row_types
                    .iter()
                    .zip(row)
                    .map(|(row_type, value)| row_type.decode(value.as_deref()))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let rows = RowSet {
            columns: row_types.into_iter().map(|r| r.name).collect_vec(),
            rows,
        };
        match query {
            Query::Describe(_) => project_describe(rows),
            Query::Select(_) => Ok(rows),
        }
    }
}
