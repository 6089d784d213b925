//! Allow-listed warehouse databases and tables that may be described.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::{CovidashError, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumIter, Display, AsRefStr,
)]
pub enum Database {
    #[strum(serialize = "COVID_DATA")]
    #[serde(rename = "COVID_DATA")]
    CovidData,
    #[strum(serialize = "GLOBAL")]
    #[serde(rename = "GLOBAL")]
    Global,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumIter, Display, AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogTable {
    AppleMobility,
    Summary,
    #[strum(serialize = "BYDATE")]
    #[serde(rename = "BYDATE")]
    ByDate,
    UnitedGlobalExtended,
}

impl Database {
    /// The tables of this database that can be described.
    pub fn tables(&self) -> Vec<CatalogTable> {
        match self {
            Database::CovidData => vec![CatalogTable::AppleMobility],
            Database::Global => vec![
                CatalogTable::Summary,
                CatalogTable::ByDate,
                CatalogTable::UnitedGlobalExtended,
            ],
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        value.parse().map_err(|_| {
            CovidashError::Validation(format!(
                "unknown database '{value}', expected one of: {}",
                Database::iter().join(", ")
            ))
        })
    }
}

/// A validated (database, table) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub database: Database,
    pub table: CatalogTable,
}

impl TableRef {
    /// Validate a (database, table) pair against the allow-list. The table must belong to the
    /// database.
    pub fn parse(database: &str, table: &str) -> Result<Self> {
        let database = Database::parse(database)?;
        let tables = database.tables();
        let table = table
            .parse::<CatalogTable>()
            .ok()
            .filter(|t| tables.contains(t))
            .ok_or_else(|| {
                CovidashError::Validation(format!(
                    "table '{table}' not found in {database} database, expected one of: {}",
                    tables.iter().join(", ")
                ))
            })?;
        Ok(Self { database, table })
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.PUBLIC.{}", self.database, self.table)
    }
}
