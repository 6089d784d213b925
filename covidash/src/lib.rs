use std::sync::Arc;

use aggregate::{AggregationEngine, DerivedMetric, MetricPoint};
use catalog::{CatalogTable, Database, TableRef};
use comments::{Comment, CommentStore, InMemoryCommentStore, JsonLinesCommentStore};
use error::{CovidashError, Result};
use itertools::Itertools;
use log::debug;
use nonempty::NonEmpty;
use query::{DateRange, Entity, FilterCriteria, Metric, Query};
use report::{Report, ReportBuilder};
use table::TabularResult;
use warehouse::{Warehouse, WarehousePool};

use crate::config::Config;

// Re-exports
pub use column_names as COL;

// Modules
pub mod aggregate;
pub mod catalog;
pub mod cluster;
pub mod column_names;
pub mod comments;
pub mod config;
pub mod error;
#[cfg(feature = "formatters")]
pub mod formatters;
pub mod query;
pub mod report;
pub mod table;
pub mod visualize;
pub mod warehouse;

/// Type for the dashboard pipeline and its collaborators
pub struct Dashboard {
    pub config: Config,
    engine: AggregationEngine,
    comments: Arc<dyn CommentStore>,
}

impl Dashboard {
    /// Setup the Dashboard object with default configuration
    pub async fn new() -> Result<Self> {
        Self::new_with_config(Config::default()).await
    }

    /// Setup the Dashboard object with custom configuration
    pub async fn new_with_config(config: Config) -> Result<Self> {
        debug!("config: {config:?}");
        let warehouse = warehouse::connect(&config.warehouse).await?;
        let comments: Arc<dyn CommentStore> = match &config.comments.path {
            Some(path) => Arc::new(JsonLinesCommentStore::new(path)),
            None => Arc::new(InMemoryCommentStore::new()),
        };
        Ok(Self::with_parts(config, warehouse, comments))
    }

    /// Setup the Dashboard object around existing collaborators
    pub fn with_parts(
        config: Config,
        warehouse: Arc<dyn Warehouse>,
        comments: Arc<dyn CommentStore>,
    ) -> Self {
        let pool = WarehousePool::new(
            warehouse,
            config.warehouse.pool_size,
            config.warehouse.query_timeout(),
        );
        Self {
            config,
            engine: AggregationEngine::new(pool),
            comments,
        }
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Look up one metric for a country on a date. Fails with `NotFound` when there is no row.
    pub async fn lookup(&self, metric_key: &str, country: &str, date: &str) -> Result<MetricPoint> {
        let metric = Metric::from_key(metric_key)?;
        let criteria = FilterCriteria::parse(country, date)?;
        self.engine
            .point_lookup(metric, &criteria)
            .await?
            .ok_or_else(|| {
                CovidashError::NotFound("No data found for the given country and date".into())
            })
    }

    /// Tables of `database` that can be described
    pub fn tables(&self, database: &str) -> Result<Vec<CatalogTable>> {
        Ok(Database::parse(database)?.tables())
    }

    pub async fn describe(&self, database: &str, table: &str) -> Result<TabularResult> {
        self.engine.describe(TableRef::parse(database, table)?).await
    }

    /// Rows of the given metrics by date and country, with rate columns appended. The inputs
    /// of every rate are fetched as well.
    pub async fn series(
        &self,
        metrics: &NonEmpty<Metric>,
        range: Option<&DateRange>,
        entity: Option<&Entity>,
        derived: &[DerivedMetric],
    ) -> Result<TabularResult> {
        let columns = metrics
            .iter()
            .map(Metric::column)
            .chain(derived.iter().flat_map(|d| [d.numerator, d.denominator]))
            .unique()
            .collect_vec();
        self.engine
            .time_series(&Query::time_series(&columns, range, entity), derived)
            .await
    }

    /// Build every chart of the dashboard report
    pub async fn visual_report(&self) -> Report {
        ReportBuilder::new(&self.engine, &self.config.report)
            .build()
            .await
    }

    /// Validate, timestamp and store a comment
    pub async fn add_comment(&self, subject_id: &str, user: &str, text: &str) -> Result<Comment> {
        let comment = Comment::new(subject_id, user, text)?;
        self.comments.append_comment(comment.clone()).await?;
        Ok(comment)
    }

    pub async fn comments(&self, subject_id: &str) -> Result<Vec<Comment>> {
        if subject_id.trim().is_empty() {
            return Err(CovidashError::Validation("Datapoint ID is required".into()));
        }
        self.comments.list_comments(subject_id).await
    }

    /// Stop issuing warehouse queries
    pub fn close(&self) {
        self.engine.pool().close();
    }
}
