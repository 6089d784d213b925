use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use itertools::Itertools;
use log::{debug, info};
use polars::prelude::*;

use super::{RowSet, Scalar, Warehouse};
use crate::catalog::TableRef;
use crate::error::{CovidashError, Result};
use crate::query::{Param, Predicate, Projection, Query, Select};
use crate::COL;

/// In-process warehouse over polars `DataFrame`s, one per table name.
#[derive(Debug, Default, Clone)]
pub struct FrameWarehouse {
    tables: HashMap<String, DataFrame>,
}

impl FrameWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a table.
    pub fn with_table(mut self, name: &str, df: DataFrame) -> Self {
        info!("registered table {name} with shape {:?}", df.shape());
        self.tables.insert(name.to_string(), df);
        self
    }

    /// Load the extended table, and optionally its metadata table, from parquet files.
    pub fn from_parquet(extended_path: &Path, metadata_path: Option<&Path>) -> Result<Self> {
        let mut warehouse = Self::new().with_table(COL::EXTENDED_TABLE, path_to_df(extended_path)?);
        if let Some(path) = metadata_path {
            warehouse = warehouse.with_table(COL::METADATA_TABLE, path_to_df(path)?);
        }
        Ok(warehouse)
    }

    fn table(&self, name: &str) -> Result<DataFrame> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| CovidashError::ServiceUnavailable(format!("table {name} is not loaded")))
    }
}

fn path_to_df(path: &Path) -> Result<DataFrame> {
    info!("Attempting to load dataframe from {}", path.display());
    LazyFrame::scan_parquet(path, ScanArgsParquet::default())?
        .collect()
        .map_err(|e| CovidashError::ServiceUnavailable(format!("Failed to load '{}': {e}", path.display())))
}

fn param_expr(param: &Param) -> Expr {
    match param {
        Param::Text(text) => lit(text.as_str()),
        Param::Date(date) => lit(*date),
    }
}

fn predicate_expr(predicate: &Predicate) -> Expr {
    match predicate {
        Predicate::Eq { column, value } => col(*column).eq(param_expr(value)),
        Predicate::Between { column, low, high } => col(*column)
            .gt_eq(param_expr(low))
            .and(col(*column).lt_eq(param_expr(high))),
    }
}

fn projection_expr(projection: &Projection) -> Expr {
    match projection {
        Projection::Column(name) => col(*name),
        Projection::Sum(name) => col(*name).sum().alias(*name),
    }
}

fn run_select(df: DataFrame, select: &Select) -> PolarsResult<DataFrame> {
    let mut lf = df.lazy();
    if let Some(predicate) = select
        .predicates
        .iter()
        .map(predicate_expr)
        .reduce(|acc, expr| acc.and(expr))
    {
        lf = lf.filter(predicate);
    }

    lf = if select.group_by.is_empty() {
        lf.select(select.columns.iter().map(projection_expr).collect_vec())
    } else {
        let keys = select.group_by.iter().map(|c| col(*c)).collect_vec();
        let aggregates = select
            .columns
            .iter()
            .filter(|p| matches!(p, Projection::Sum(_)))
            .map(projection_expr)
            .collect_vec();
        lf.group_by(keys)
            .agg(aggregates)
            .select(select.columns.iter().map(|p| col(p.output_name())).collect_vec())
    };

    if select.distinct {
        lf = lf.unique_stable(None, UniqueKeepStrategy::First);
    }
    if !select.order_by.is_empty() {
        lf = lf.sort(select.order_by.clone(), SortMultipleOptions::default());
    }
    lf.collect()
}

fn describe(df: &DataFrame) -> PolarsResult<DataFrame> {
    let (names, types): (Vec<String>, Vec<String>) = df
        .get_columns()
        .iter()
        .map(|s| (s.name().to_string(), s.dtype().to_string()))
        .unzip();
    DataFrame::new(vec![
        Series::new(COL::DESCRIBE_NAME, names),
        Series::new(COL::DESCRIBE_TYPE, types),
    ])
}

/// Convert a collected frame into warehouse rows.
pub(crate) fn df_to_rowset(df: &DataFrame) -> Result<RowSet> {
    let columns = df
        .get_columns()
        .iter()
        .map(|s| s.name().to_string())
        .collect_vec();
    let mut rows = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        let row = df
            .get_columns()
            .iter()
            .map(|s| Scalar::try_from(s.get(idx)?))
            .collect::<Result<Vec<_>>>()?;
        rows.push(row);
    }
    Ok(RowSet { columns, rows })
}

/// Missing or mistyped columns mean the loaded tables drifted from the schema; anything else
/// is a fault of the query engine.
fn query_error(err: PolarsError) -> CovidashError {
    match err {
        PolarsError::Context { error, .. } => query_error(*error),
        PolarsError::ColumnNotFound(msg)
        | PolarsError::SchemaMismatch(msg)
        | PolarsError::SchemaFieldNotFound(msg) => {
            CovidashError::DataIntegrity(format!("table does not match the schema: {msg}"))
        }
        other => CovidashError::ServiceUnavailable(format!("query failed: {other}")),
    }
}

fn describe_table_name(table: &TableRef) -> String {
    table.table.to_string()
}

#[async_trait]
impl Warehouse for FrameWarehouse {
    async fn execute(&self, query: &Query) -> Result<RowSet> {
        let df = match query {
            Query::Select(select) => {
                let df = self.table(select.table)?;
                let select = select.clone();
                // Required because polars is blocking
                tokio::task::spawn_blocking(move || run_select(df, &select))
                    .await
                    .map_err(|e| CovidashError::ServiceUnavailable(format!("query task failed: {e}")))?
                    .map_err(query_error)?
            }
            Query::Describe(table) => describe(&self.table(&describe_table_name(table))?)?,
        };
        debug!("query returned shape {:?}", df.shape());
        df_to_rowset(&df)
    }
}
