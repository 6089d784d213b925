//! Builds parameterized analytical queries against the warehouse.
//!
//! Queries are plain data: an identifier-only statement template (rendered with `?`
//! placeholders by [`Query::sql`]) plus the ordered list of bound values returned by
//! [`Query::params`]. Identifiers are taken from [`crate::COL`] and the catalogue allow-list, so
//! request input only ever reaches the warehouse as a bound parameter.

use std::fmt::Display;
use std::str::FromStr;

use chrono::NaiveDate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, EnumIter, EnumString};

use crate::catalog::TableRef;
use crate::error::{CovidashError, Result};
use crate::COL;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// The metrics that can be looked up for a single country and date.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumIter, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalCases,
    Population,
    Vaccinated,
    Unvaccinated,
    TotalTests,
    TotalDeath,
}

impl Metric {
    /// Parse a metric key, failing validation for anything outside the allow-list.
    pub fn from_key(key: &str) -> Result<Self> {
        key.parse().map_err(|_| {
            CovidashError::Validation(format!(
                "unknown metric '{key}', expected one of: {}",
                Metric::iter().map(|m| m.key()).join(", ")
            ))
        })
    }

    /// Warehouse column holding this metric.
    pub fn column(&self) -> &'static str {
        match self {
            Metric::TotalCases => COL::TOTAL_CASES,
            Metric::Population => COL::POPULATION,
            Metric::Vaccinated => COL::VACCINATED,
            Metric::Unvaccinated => COL::UNVACCINATED,
            Metric::TotalTests => COL::TOTAL_TESTS,
            Metric::TotalDeath => COL::TOTAL_DEATH,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::TotalCases => "Total Cases",
            Metric::Population => "Population",
            Metric::Vaccinated => "Vaccinated",
            Metric::Unvaccinated => "Unvaccinated",
            Metric::TotalTests => "Total Tests",
            Metric::TotalDeath => "Total Death",
        }
    }

    /// Response key derived from the label, e.g. "Total Cases" -> "total_cases".
    pub fn key(&self) -> String {
        self.label().to_lowercase().replace(' ', "_")
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    if value.is_empty() {
        return Err(CovidashError::Validation("date is required".into()));
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| {
        CovidashError::Validation(format!("'{value}' is not a valid date, expected YYYY-MM-DD"))
    })
}

/// A country or location name. Matched case-sensitively and never normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity(String);

impl Entity {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CovidashError::Validation("country is required".into()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filter for a point lookup: exactly one entity on exactly one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCriteria {
    pub entity: Entity,
    pub date: NaiveDate,
}

impl FilterCriteria {
    pub fn parse(entity: &str, date: &str) -> Result<Self> {
        Ok(Self {
            entity: Entity::new(entity)?,
            date: parse_date(date)?,
        })
    }
}

/// An inclusive range of dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(CovidashError::Validation(format!(
                "invalid date range: {start} is after {end}"
            )));
        }
        Ok(Self { start, end })
    }
}

/// Expected format: `START...END` or a single `DATE` for a one day range.
impl FromStr for DateRange {
    type Err = CovidashError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split("...").collect_vec().as_slice() {
            [date] => {
                let date = parse_date(date.trim())?;
                DateRange::new(date, date)
            }
            [start, end] => DateRange::new(parse_date(start.trim())?, parse_date(end.trim())?),
            _ => Err(CovidashError::Validation(format!(
                "invalid date range '{s}', expected START...END"
            ))),
        }
    }
}

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Param {
    Text(String),
    Date(NaiveDate),
}

impl Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Param::Text(text) => f.write_str(text),
            Param::Date(date) => write!(f, "{}", date.format(DATE_FORMAT)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Column(&'static str),
    /// `SUM(col) AS col`
    Sum(&'static str),
}

impl Projection {
    /// Name of the column this projection produces.
    pub fn output_name(&self) -> &'static str {
        match self {
            Projection::Column(name) | Projection::Sum(name) => *name,
        }
    }

    fn sql(&self) -> String {
        match self {
            Projection::Column(name) => (*name).to_string(),
            Projection::Sum(name) => format!("SUM({name}) AS {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq {
        column: &'static str,
        value: Param,
    },
    Between {
        column: &'static str,
        low: Param,
        high: Param,
    },
}

impl Predicate {
    fn sql(&self) -> String {
        match self {
            Predicate::Eq { column, .. } => format!("{column} = ?"),
            Predicate::Between { column, .. } => format!("{column} BETWEEN ? AND ?"),
        }
    }

    fn params(&self) -> Vec<Param> {
        match self {
            Predicate::Eq { value, .. } => vec![value.clone()],
            Predicate::Between { low, high, .. } => vec![low.clone(), high.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: &'static str,
    pub columns: Vec<Projection>,
    pub predicates: Vec<Predicate>,
    pub distinct: bool,
    pub group_by: Vec<&'static str>,
    pub order_by: Vec<&'static str>,
}

impl Select {
    fn new(table: &'static str, columns: Vec<Projection>) -> Self {
        Self {
            table,
            columns,
            predicates: vec![],
            distinct: false,
            group_by: vec![],
            order_by: vec![],
        }
    }

    fn sql(&self) -> String {
        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if self.distinct { "DISTINCT " } else { "" },
            self.columns.iter().map(Projection::sql).join(", "),
            self.table
        );
        if !self.predicates.is_empty() {
            sql += &format!(
                " WHERE {}",
                self.predicates.iter().map(Predicate::sql).join(" AND ")
            );
        }
        if !self.group_by.is_empty() {
            sql += &format!(" GROUP BY {}", self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            sql += &format!(" ORDER BY {}", self.order_by.iter().map(|c| format!("{c} ASC")).join(", "));
        }
        sql
    }
}

/// A fully specified query, ready to hand to a [`crate::warehouse::Warehouse`].
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Select),
    Describe(TableRef),
}

impl Query {
    /// Statement text with `?` placeholders for every bound value.
    pub fn sql(&self) -> String {
        match self {
            Query::Select(select) => select.sql(),
            Query::Describe(table) => format!("DESCRIBE TABLE {}", table.qualified_name()),
        }
    }

    /// Bound values, in placeholder order.
    pub fn params(&self) -> Vec<Param> {
        match self {
            Query::Select(select) => select.predicates.iter().flat_map(Predicate::params).collect(),
            Query::Describe(_) => vec![],
        }
    }

    /// Names of the columns the result set is expected to have, in order.
    pub fn output_columns(&self) -> Vec<&'static str> {
        match self {
            Query::Select(select) => select.columns.iter().map(Projection::output_name).collect(),
            Query::Describe(_) => vec![COL::DESCRIBE_NAME, COL::DESCRIBE_TYPE],
        }
    }

    /// Columns the result is ordered by, if any.
    pub fn order_by(&self) -> &[&'static str] {
        match self {
            Query::Select(select) => &select.order_by,
            Query::Describe(_) => &[],
        }
    }

    /// `SELECT ID, <metric> ... WHERE COUNTRY = ? AND DATE = ?`
    pub fn point_lookup(metric: Metric, criteria: &FilterCriteria) -> Self {
        let mut select = Select::new(
            COL::EXTENDED_TABLE,
            vec![Projection::Column(COL::ID), Projection::Column(metric.column())],
        );
        select.predicates = vec![
            Predicate::Eq {
                column: COL::COUNTRY,
                value: Param::Text(criteria.entity.as_str().to_string()),
            },
            Predicate::Eq {
                column: COL::DATE,
                value: Param::Date(criteria.date),
            },
        ];
        Query::Select(select)
    }

    /// Rows of `DATE`, `COUNTRY` and the given columns, optionally restricted to a date range
    /// and a single entity, ordered by date then entity.
    pub fn time_series(
        columns: &[&'static str],
        range: Option<&DateRange>,
        entity: Option<&Entity>,
    ) -> Self {
        let mut projections = vec![
            Projection::Column(COL::DATE),
            Projection::Column(COL::COUNTRY),
        ];
        projections.extend(
            columns
                .iter()
                .filter(|c| **c != COL::DATE && **c != COL::COUNTRY)
                .map(|c| Projection::Column(*c)),
        );
        let mut select = Select::new(COL::EXTENDED_TABLE, projections);
        select.predicates = series_predicates(range, entity);
        select.order_by = vec![COL::DATE, COL::COUNTRY];
        Query::Select(select)
    }

    /// Per-date totals of `column`. Grouped by entity as well unless a single entity is
    /// requested.
    pub fn summed_series(column: &'static str, range: &DateRange, entity: Option<&Entity>) -> Self {
        let keys = match entity {
            Some(_) => vec![COL::DATE],
            None => vec![COL::DATE, COL::COUNTRY],
        };
        let mut projections = keys.iter().map(|k| Projection::Column(*k)).collect_vec();
        projections.push(Projection::Sum(column));
        let mut select = Select::new(COL::EXTENDED_TABLE, projections);
        select.predicates = series_predicates(Some(range), entity);
        select.group_by = keys.clone();
        select.order_by = keys;
        Query::Select(select)
    }

    /// All entities with the given columns on a single date.
    pub fn snapshot(date: NaiveDate, columns: &[&'static str]) -> Self {
        let mut projections = vec![Projection::Column(COL::COUNTRY)];
        projections.extend(
            columns
                .iter()
                .filter(|c| **c != COL::COUNTRY)
                .map(|c| Projection::Column(*c)),
        );
        let mut select = Select::new(COL::EXTENDED_TABLE, projections);
        select.predicates = vec![Predicate::Eq {
            column: COL::DATE,
            value: Param::Date(date),
        }];
        select.order_by = vec![COL::COUNTRY];
        Query::Select(select)
    }

    /// Every entity that has at least one observation.
    pub fn distinct_entities() -> Self {
        let mut select = Select::new(COL::EXTENDED_TABLE, vec![Projection::Column(COL::COUNTRY)]);
        select.distinct = true;
        select.order_by = vec![COL::COUNTRY];
        Query::Select(select)
    }

    /// The metadata table describing the columns of the extended table.
    pub fn column_metadata() -> Self {
        Query::Select(Select::new(
            COL::METADATA_TABLE,
            [
                COL::METADATA_COLUMN_NAME,
                COL::METADATA_DATA_TYPE,
                COL::METADATA_DESCRIPTION,
                COL::METADATA_MIN_VALUE,
                COL::METADATA_MAX_VALUE,
            ]
            .into_iter()
            .map(Projection::Column)
            .collect(),
        ))
    }

    /// Describe an allow-listed table. The extended table is described by its metadata table.
    pub fn describe(table: TableRef) -> Self {
        match table.table {
            crate::catalog::CatalogTable::UnitedGlobalExtended => Self::column_metadata(),
            _ => Query::Describe(table),
        }
    }
}

fn series_predicates(range: Option<&DateRange>, entity: Option<&Entity>) -> Vec<Predicate> {
    let mut predicates = vec![];
    if let Some(entity) = entity {
        predicates.push(Predicate::Eq {
            column: COL::COUNTRY,
            value: Param::Text(entity.as_str().to_string()),
        });
    }
    if let Some(range) = range {
        predicates.push(Predicate::Between {
            column: COL::DATE,
            low: Param::Date(range.start),
            high: Param::Date(range.end),
        });
    }
    predicates
}
