//! Executes queries through the warehouse pool and shapes the rows into [`TabularResult`]s.

use log::{debug, warn};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::catalog::TableRef;
use crate::error::Result;
use crate::query::{FilterCriteria, Metric, Query};
use crate::table::TabularResult;
use crate::warehouse::{Scalar, WarehousePool};
use crate::COL;

/// A percentage column computed from two columns already present in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedMetric {
    pub name: &'static str,
    pub numerator: &'static str,
    pub denominator: &'static str,
}

impl DerivedMetric {
    pub const MORTALITY: Self = Self {
        name: COL::MORTALITY_RATE,
        numerator: COL::TOTAL_DEATH,
        denominator: COL::TOTAL_CASES,
    };
    pub const VACCINATION: Self = Self {
        name: COL::VACCINATION_RATE,
        numerator: COL::VACCINATED,
        denominator: COL::POPULATION,
    };
    pub const UNVACCINATION: Self = Self {
        name: COL::UNVACCINATION_RATE,
        numerator: COL::UNVACCINATED,
        denominator: COL::POPULATION,
    };

    /// Every rate the dashboard reports, in the order they are derived.
    pub const ALL: [Self; 3] = [Self::MORTALITY, Self::VACCINATION, Self::UNVACCINATION];
}

/// The value of one metric for one entity and date, with the row's identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub id: Scalar,
    pub metric: Metric,
    pub value: Scalar,
}

/// Serializes as `{"id": .., "<metric key>": ..}`.
impl Serialize for MetricPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry(&self.metric.key(), &self.value)?;
        map.end()
    }
}

#[derive(Clone)]
pub struct AggregationEngine {
    pool: WarehousePool,
}

impl AggregationEngine {
    pub fn new(pool: WarehousePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &WarehousePool {
        &self.pool
    }

    /// Run a query and shape its rows, ordered as the query requests.
    pub async fn fetch(&self, query: &Query) -> Result<TabularResult> {
        let rows = self.pool.execute(query).await?;
        let mut table = TabularResult::from_rowset(&query.output_columns(), rows)?;
        table.sort_by(query.order_by())?;
        Ok(table)
    }

    /// Look up a single metric. `None` when no row matches.
    pub async fn point_lookup(
        &self,
        metric: Metric,
        criteria: &FilterCriteria,
    ) -> Result<Option<MetricPoint>> {
        let table = self.fetch(&Query::point_lookup(metric, criteria)).await?;
        if table.is_empty() {
            debug!("no {metric} for {} on {}", criteria.entity, criteria.date);
            return Ok(None);
        }
        if table.height() > 1 {
            warn!(
                "{} rows match {} on {}, using the first",
                table.height(),
                criteria.entity,
                criteria.date
            );
        }
        Ok(Some(MetricPoint {
            id: table.scalar(0, COL::ID)?,
            metric,
            value: table.scalar(0, metric.column())?,
        }))
    }

    /// Run a series query and append the derived columns in the given order.
    pub async fn time_series(&self, query: &Query, derived: &[DerivedMetric]) -> Result<TabularResult> {
        let mut table = self.fetch(query).await?;
        for metric in derived {
            table.derive_rate(metric.name, metric.numerator, metric.denominator)?;
        }
        Ok(table)
    }

    pub async fn describe(&self, table: TableRef) -> Result<TabularResult> {
        self.fetch(&Query::describe(table)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::NaiveDate;
    use itertools::Itertools;
    use serde_json::json;

    use super::*;
    use crate::error::CovidashError;
    use crate::query::{DateRange, Entity};
    use crate::table::Rate;
    use crate::warehouse::frame::tests::{date, test_warehouse};
    use crate::warehouse::tests::ScriptedWarehouse;
    use crate::warehouse::{RowSet, Warehouse};

    fn engine(warehouse: Arc<dyn Warehouse>) -> AggregationEngine {
        AggregationEngine::new(WarehousePool::new(warehouse, 2, Duration::from_secs(5)))
    }

    fn frame_engine() -> AggregationEngine {
        engine(Arc::new(test_warehouse()))
    }

    #[tokio::test]
    async fn empty_series_should_keep_derived_columns() -> anyhow::Result<()> {
        let range = DateRange::new(date("2020-01-01"), date("2020-12-31"))?;
        let query = Query::time_series(
            &[COL::VACCINATED, COL::UNVACCINATED, COL::POPULATION, COL::TOTAL_CASES, COL::TOTAL_DEATH],
            Some(&range),
            None,
        );
        let table = frame_engine()
            .time_series(&query, &DerivedMetric::ALL)
            .await?;
        assert!(table.is_empty());
        assert_eq!(
            table.derived(),
            &[COL::MORTALITY_RATE, COL::VACCINATION_RATE, COL::UNVACCINATION_RATE]
        );
        Ok(())
    }

    #[tokio::test]
    async fn null_population_should_leave_rates_undefined() -> anyhow::Result<()> {
        let columns = [COL::DATE, COL::COUNTRY, COL::VACCINATED, COL::POPULATION];
        let warehouse = ScriptedWarehouse::new(vec![Ok(RowSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: vec![vec![
                Scalar::Date(date("2021-06-01")),
                Scalar::Text("Latvia".into()),
                Scalar::Int(10),
                Scalar::Null,
            ]],
        })]);
        let query = Query::time_series(&[COL::VACCINATED, COL::POPULATION], None, None);
        let table = engine(Arc::new(warehouse))
            .time_series(&query, &[DerivedMetric::VACCINATION])
            .await?;
        assert_eq!(table.rates(COL::VACCINATION_RATE)?, vec![Rate::Undefined]);
        assert_eq!(table.to_records()?[0][COL::VACCINATION_RATE], json!(null));
        Ok(())
    }

    #[tokio::test]
    async fn point_lookup_should_return_stored_value() -> anyhow::Result<()> {
        let criteria = FilterCriteria::parse("Latvia", "2021-06-01")?;
        let point = frame_engine()
            .point_lookup(Metric::TotalCases, &criteria)
            .await?
            .expect("a row");
        assert_eq!(point.value, Scalar::Int(150_000));
        assert_eq!(
            serde_json::to_value(&point)?,
            json!({"id": "LV-0601", "total_cases": 150000})
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_point_should_be_none() -> anyhow::Result<()> {
        let criteria = FilterCriteria::parse("Atlantis", "2021-06-01")?;
        let point = frame_engine()
            .point_lookup(Metric::Population, &criteria)
            .await?;
        assert!(point.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_points_should_use_first_row() -> anyhow::Result<()> {
        let rows = RowSet {
            columns: vec![COL::ID.into(), COL::TOTAL_DEATH.into()],
            rows: vec![
                vec![Scalar::Text("A".into()), Scalar::Int(1)],
                vec![Scalar::Text("B".into()), Scalar::Int(2)],
            ],
        };
        let engine = engine(Arc::new(ScriptedWarehouse::new(vec![Ok(rows)])));
        let criteria = FilterCriteria::parse("Latvia", "2021-06-01")?;
        let point = engine
            .point_lookup(Metric::TotalDeath, &criteria)
            .await?
            .expect("a row");
        assert_eq!(point.id, Scalar::Text("A".into()));
        Ok(())
    }

    #[tokio::test]
    async fn series_should_be_ordered_by_date_then_entity() -> anyhow::Result<()> {
        let range: DateRange = "2021-01-01...2021-12-31".parse()?;
        let table = frame_engine()
            .time_series(&Query::time_series(&[COL::TOTAL_CASES], Some(&range), None), &[])
            .await?;
        let dates = table.column_values(COL::DATE)?;
        let countries = table.column_values(COL::COUNTRY)?;
        let keys = dates
            .iter()
            .zip(&countries)
            .map(|(d, c)| (d.to_string(), c.to_string()))
            .collect_vec();
        assert_eq!(keys.len(), 5);
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(keys[0], ("2021-06-01".to_string(), "Austria".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn engine_should_sort_unordered_warehouse_rows() -> anyhow::Result<()> {
        let d = |s: &str| Scalar::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap());
        let rows = RowSet {
            columns: vec![COL::DATE.into(), COL::COUNTRY.into(), COL::TOTAL_CASES.into()],
            rows: vec![
                vec![d("2021-06-02"), Scalar::Text("Latvia".into()), Scalar::Int(3)],
                vec![d("2021-06-01"), Scalar::Text("Latvia".into()), Scalar::Int(2)],
                vec![d("2021-06-01"), Scalar::Text("Estonia".into()), Scalar::Int(1)],
            ],
        };
        let engine = engine(Arc::new(ScriptedWarehouse::new(vec![Ok(rows)])));
        let range: DateRange = "2021-06-01...2021-06-02".parse()?;
        let table = engine
            .time_series(&Query::time_series(&[COL::TOTAL_CASES], Some(&range), None), &[])
            .await?;
        assert_eq!(
            table.column_values(COL::TOTAL_CASES)?,
            vec![Scalar::Int(1), Scalar::Int(2), Scalar::Int(3)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn series_should_derive_rates_in_order() -> anyhow::Result<()> {
        let latvia = Entity::new("Latvia")?;
        let query = Query::time_series(
            &[COL::POPULATION, COL::VACCINATED, COL::UNVACCINATED, COL::TOTAL_CASES, COL::TOTAL_DEATH],
            None,
            Some(&latvia),
        );
        let table = frame_engine().time_series(&query, &DerivedMetric::ALL).await?;
        assert_eq!(
            table.derived(),
            &[COL::MORTALITY_RATE, COL::VACCINATION_RATE, COL::UNVACCINATION_RATE]
        );
        match table.rates(COL::MORTALITY_RATE)?[0] {
            Rate::Defined(v) => assert!((v - 2_490.0 / 150_000.0 * 100.0).abs() < 1e-9),
            Rate::Undefined => panic!("rate should be defined"),
        }
        assert_eq!(table.scalar(0, COL::DATE)?, Scalar::Date(date("2021-06-01")));
        Ok(())
    }

    #[tokio::test]
    async fn derived_metric_without_inputs_should_fail() -> anyhow::Result<()> {
        let query = Query::time_series(&[COL::TOTAL_CASES], None, None);
        let err = frame_engine()
            .time_series(&query, &[DerivedMetric::MORTALITY])
            .await
            .unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));
        Ok(())
    }

    #[tokio::test]
    async fn shape_mismatch_should_fail_integrity() -> anyhow::Result<()> {
        let rows = RowSet {
            columns: vec![COL::ID.into()],
            rows: vec![vec![Scalar::Text("A".into())]],
        };
        let engine = engine(Arc::new(ScriptedWarehouse::new(vec![Ok(rows)])));
        let criteria = FilterCriteria::parse("Latvia", "2021-06-01")?;
        let err = engine
            .point_lookup(Metric::TotalCases, &criteria)
            .await
            .unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));
        Ok(())
    }

    #[tokio::test]
    async fn warehouse_faults_should_propagate() -> anyhow::Result<()> {
        let engine = engine(Arc::new(ScriptedWarehouse::new(vec![Err(
            CovidashError::ServiceUnavailable("connection refused".into()),
        )])));
        let err = engine.fetch(&Query::distinct_entities()).await.unwrap_err();
        assert!(err.is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn describe_extended_table_should_use_metadata() -> anyhow::Result<()> {
        let table = TableRef::parse("GLOBAL", "UNITED_GLOBAL_EXTENDED")?;
        let description = frame_engine().describe(table).await?;
        assert_eq!(description.height(), 2);
        assert_eq!(
            description.column_names(),
            vec!["COLUMN_NAME", "DATA_TYPE", "DESCRIPTION", "MIN_VALUE", "MAX_VALUE"]
        );
        Ok(())
    }
}
