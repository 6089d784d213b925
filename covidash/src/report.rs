//! Assembles the dashboard report. Every chart is built independently, so one failing query
//! only costs its own slot.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use log::{error, info};
use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, IntoStaticStr};

use crate::aggregate::{AggregationEngine, DerivedMetric};
use crate::cluster;
use crate::config::ReportConfig;
use crate::error::Result;
use crate::query::{DateRange, Entity, Query};
use crate::visualize::{self, escape_html, Encoding};
use crate::COL;

const PLOTLY_SCRIPT: &str =
    r#"<script src="https://cdn.plot.ly/plotly-2.35.2.min.js" charset="utf-8"></script>"#;

/// Raw columns of the extended table used by the demographic charts.
const DEMOGRAPHIC_COLUMNS: [&str; 6] = [
    COL::POPULATION,
    COL::VACCINATED,
    COL::UNVACCINATED,
    COL::TOTAL_TESTS,
    COL::TOTAL_CASES,
    COL::TOTAL_DEATH,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, EnumIter, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReportSlot {
    WorldMap,
    Clustering,
    VaccinationRates,
    TotalCasesAllCountries,
    TotalCasesFocus,
    FocusDemographics,
}

impl ReportSlot {
    /// Element id of the slot's chart.
    pub fn id(&self) -> &'static str {
        (*self).into()
    }

    pub fn heading(&self, config: &ReportConfig) -> String {
        match self {
            ReportSlot::WorldMap => "World map".into(),
            ReportSlot::Clustering => format!("Clustering on {}", config.cluster_date),
            ReportSlot::VaccinationRates => {
                format!("Vaccination rates {} to {}", config.start, config.end)
            }
            ReportSlot::TotalCasesAllCountries => "Total cases in all countries".into(),
            ReportSlot::TotalCasesFocus => format!("Total cases in {}", config.focus_country),
            ReportSlot::FocusDemographics => {
                format!("Demographic breakdown for {}", config.focus_country)
            }
        }
    }
}

/// One rendered slot. `html` is a placeholder when the chart could not be built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chart {
    pub slot: ReportSlot,
    pub heading: String,
    pub html: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub charts: Vec<Chart>,
}

impl Report {
    pub fn get(&self, slot: ReportSlot) -> Option<&Chart> {
        self.charts.iter().find(|chart| chart.slot == slot)
    }

    /// Slots whose chart could not be built.
    pub fn unavailable(&self) -> Vec<ReportSlot> {
        self.charts
            .iter()
            .filter(|chart| !chart.available)
            .map(|chart| chart.slot)
            .collect()
    }

    /// A complete HTML page loading Plotly once and showing every slot in order.
    pub fn to_html_page(&self) -> String {
        let sections: String = self
            .charts
            .iter()
            .map(|chart| {
                format!(
                    "<section class=\"chart\" id=\"section-{slot}\">\n<h2>{}</h2>\n{}\n</section>\n",
                    escape_html(&chart.heading),
                    chart.html,
                    slot = chart.slot,
                )
            })
            .collect();
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <title>COVID-19 dashboard</title>\n{PLOTLY_SCRIPT}\n</head>\n<body>\n\
             <h1>COVID-19 dashboard</h1>\n{sections}</body>\n</html>\n"
        )
    }
}

/// Builds the dashboard [`Report`] from an engine and the report settings.
pub struct ReportBuilder<'a> {
    engine: &'a AggregationEngine,
    config: &'a ReportConfig,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(engine: &'a AggregationEngine, config: &'a ReportConfig) -> Self {
        Self { engine, config }
    }

    async fn world_map(&self, id: &str) -> Result<String> {
        let countries = self.engine.fetch(&Query::distinct_entities()).await?;
        visualize::render(
            &countries,
            &Encoding::choropleth(COL::COUNTRY, "Country in which the data was observed"),
            id,
        )
    }

    async fn clustering(&self, id: &str) -> Result<String> {
        let snapshot = self
            .engine
            .fetch(&Query::snapshot(self.config.cluster_date, &cluster::FEATURES))
            .await?;
        visualize::cluster_map(
            &snapshot,
            COL::COUNTRY,
            &cluster::FEATURES,
            self.config.cluster_count,
            "COVID-19 Clustering by Country",
            id,
        )
    }

    async fn vaccination_rates(&self, range: DateRange, id: &str) -> Result<String> {
        let query = Query::time_series(&DEMOGRAPHIC_COLUMNS, Some(&range), None);
        let table = self.engine.time_series(&query, &DerivedMetric::ALL).await?;
        visualize::render(
            &table,
            &rates_encoding(&format!(
                "Demographic Breakdown: Vaccinated vs Unvaccinated ({} to {})",
                range.start, range.end
            )),
            id,
        )
    }

    async fn total_cases(&self, range: DateRange, entity: Option<Entity>, id: &str) -> Result<String> {
        let query = Query::summed_series(COL::TOTAL_CASES, &range, entity.as_ref());
        let table = self.engine.time_series(&query, &[]).await?;
        let encoding = match &entity {
            Some(entity) => Encoding::line(
                COL::DATE,
                &[COL::TOTAL_CASES],
                &format!("Total cases in {entity} over time"),
            ),
            None => Encoding::line(
                COL::DATE,
                &[COL::TOTAL_CASES],
                "Countries with total cases over time",
            )
            .with_color(COL::COUNTRY),
        };
        visualize::render(&table, &encoding, id)
    }

    async fn focus_demographics(&self, entity: Entity, id: &str) -> Result<String> {
        let query = Query::time_series(&DEMOGRAPHIC_COLUMNS, None, Some(&entity));
        let table = self.engine.time_series(&query, &DerivedMetric::ALL).await?;
        visualize::render(
            &table,
            &rates_encoding(&format!(
                "Demographic Breakdown: Vaccinated vs Unvaccinated ({entity})"
            )),
            id,
        )
    }

    fn slot(&self, slot: ReportSlot) -> BoxFuture<'_, Result<String>> {
        let id = slot.id();
        let range = self.config.range();
        let focus = Entity::new(self.config.focus_country.as_str());
        async move {
            match slot {
                ReportSlot::WorldMap => self.world_map(id).await,
                ReportSlot::Clustering => self.clustering(id).await,
                ReportSlot::VaccinationRates => self.vaccination_rates(range?, id).await,
                ReportSlot::TotalCasesAllCountries => self.total_cases(range?, None, id).await,
                ReportSlot::TotalCasesFocus => self.total_cases(range?, Some(focus?), id).await,
                ReportSlot::FocusDemographics => self.focus_demographics(focus?, id).await,
            }
        }
        .boxed()
    }

    /// Build every slot concurrently. Failures become per-slot placeholders.
    pub async fn build(&self) -> Report {
        let slots = ReportSlot::iter().collect::<Vec<_>>();
        let results = join_all(slots.iter().map(|slot| self.slot(*slot))).await;
        let charts = slots
            .into_iter()
            .zip(results)
            .map(|(slot, result)| {
                let (html, available) = match result {
                    Ok(html) => (html, true),
                    Err(err) => {
                        error!("chart {slot} unavailable: {err}");
                        (
                            visualize::placeholder(slot.id(), &format!("Chart unavailable: {err}")),
                            false,
                        )
                    }
                };
                Chart {
                    slot,
                    heading: slot.heading(self.config),
                    html,
                    available,
                }
            })
            .collect::<Vec<_>>();
        info!(
            "built report with {} of {} charts",
            charts.iter().filter(|c| c.available).count(),
            charts.len()
        );
        Report { charts }
    }
}

fn rates_encoding(title: &str) -> Encoding {
    Encoding::bar(
        COL::DATE,
        &[COL::VACCINATION_RATE, COL::UNVACCINATION_RATE],
        title,
    )
    .with_labels(COL::DATE, "Percentage")
    .with_legend_title("Group")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::CovidashError;
    use crate::warehouse::frame::tests::{date, test_warehouse};
    use crate::warehouse::{FrameWarehouse, RowSet, Warehouse, WarehousePool};

    fn engine(warehouse: Arc<dyn Warehouse>) -> AggregationEngine {
        AggregationEngine::new(WarehousePool::new(warehouse, 2, Duration::from_secs(5)))
    }

    fn june_config() -> ReportConfig {
        ReportConfig {
            start: date("2021-06-01"),
            end: date("2021-06-30"),
            focus_country: "Latvia".into(),
            cluster_date: date("2021-06-01"),
            cluster_count: 3,
        }
    }

    #[tokio::test]
    async fn report_should_fill_every_slot() {
        let engine = engine(Arc::new(test_warehouse()));
        let config = june_config();
        let report = ReportBuilder::new(&engine, &config).build().await;
        assert_eq!(report.charts.len(), 6);
        assert!(report.unavailable().is_empty());
        let clustering = report.get(ReportSlot::Clustering).unwrap();
        assert!(clustering.html.contains("Plotly.newPlot(\"clustering\""));
        let focus = report.get(ReportSlot::TotalCasesFocus).unwrap();
        assert!(focus.html.contains("Total cases in Latvia over time"));

        let page = report.to_html_page();
        assert_eq!(page.matches("cdn.plot.ly").count(), 1);
        assert_eq!(page.matches("<section").count(), 6);
    }

    #[tokio::test]
    async fn clustering_without_data_should_be_a_placeholder() {
        let engine = engine(Arc::new(test_warehouse()));
        let config = ReportConfig {
            cluster_date: date("2020-01-01"),
            ..june_config()
        };
        let report = ReportBuilder::new(&engine, &config).build().await;
        let clustering = report.get(ReportSlot::Clustering).unwrap();
        assert!(clustering.available);
        assert!(clustering.html.contains("No data available for clustering."));
    }

    #[tokio::test]
    async fn report_without_data_should_draw_empty_charts() {
        let engine = engine(Arc::new(test_warehouse()));
        let config = ReportConfig {
            start: date("2020-01-01"),
            end: date("2020-12-31"),
            focus_country: "Atlantis".into(),
            cluster_date: date("2020-06-01"),
            cluster_count: 3,
        };
        let report = ReportBuilder::new(&engine, &config).build().await;
        assert!(report.unavailable().is_empty());
        let rates = report.get(ReportSlot::VaccinationRates).unwrap();
        assert!(rates.html.contains("Plotly.newPlot(\"vaccination_rates\""));
        let demographics = report.get(ReportSlot::FocusDemographics).unwrap();
        assert!(demographics.html.contains("(Atlantis)"));
    }

    /// Fails the distinct entity query, answers everything else from the fixture tables.
    struct EntitiesDown(FrameWarehouse);

    #[async_trait]
    impl Warehouse for EntitiesDown {
        async fn execute(&self, query: &Query) -> Result<RowSet> {
            if *query == Query::distinct_entities() {
                return Err(CovidashError::ServiceUnavailable("warehouse is down".into()));
            }
            self.0.execute(query).await
        }
    }

    #[tokio::test]
    async fn failing_slots_should_not_sink_the_report() {
        let engine = engine(Arc::new(EntitiesDown(test_warehouse())));
        let config = june_config();
        let report = ReportBuilder::new(&engine, &config).build().await;
        assert_eq!(report.charts.len(), 6);
        assert_eq!(report.unavailable(), vec![ReportSlot::WorldMap]);
        let chart = report.get(ReportSlot::WorldMap).unwrap();
        assert!(chart.html.contains("chart-placeholder"));
        assert!(chart.html.contains("warehouse is down"));
        assert!(report.to_html_page().contains("id=\"section-world_map\""));
    }

    #[tokio::test]
    async fn invalid_focus_country_should_only_affect_focus_slots() {
        let engine = engine(Arc::new(test_warehouse()));
        let config = ReportConfig {
            focus_country: " ".into(),
            ..june_config()
        };
        let report = ReportBuilder::new(&engine, &config).build().await;
        assert_eq!(
            report.unavailable(),
            vec![ReportSlot::TotalCasesFocus, ReportSlot::FocusDemographics]
        );
    }
}
