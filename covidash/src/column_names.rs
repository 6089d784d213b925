//! This module stores the table and column names of the warehouse schema. Identifiers used in
//! queries only ever come from here, never from request input. Note that this must be
//! synchronised with the upstream warehouse schema!

pub const EXTENDED_TABLE: &str = "UNITED_GLOBAL_EXTENDED";
pub const METADATA_TABLE: &str = "UNITED_GLOBAL_METADATA";

pub const ID: &str = "ID";
pub const DATE: &str = "DATE";
pub const COUNTRY: &str = "COUNTRY";
pub const POPULATION: &str = "POPULATION";
pub const VACCINATED: &str = "VACCINATED";
pub const UNVACCINATED: &str = "UNVACCINATED";
pub const TOTAL_TESTS: &str = "TOTAL_TESTS";
pub const TOTAL_CASES: &str = "TOTAL_CASES";
pub const TOTAL_DEATH: &str = "TOTAL_DEATH";

pub const METADATA_COLUMN_NAME: &str = "COLUMN_NAME";
pub const METADATA_DATA_TYPE: &str = "DATA_TYPE";
pub const METADATA_DESCRIPTION: &str = "DESCRIPTION";
pub const METADATA_MIN_VALUE: &str = "MIN_VALUE";
pub const METADATA_MAX_VALUE: &str = "MAX_VALUE";

/// Columns produced by `DESCRIBE TABLE`.
pub const DESCRIBE_NAME: &str = "name";
pub const DESCRIBE_TYPE: &str = "type";

// Derived columns
pub const MORTALITY_RATE: &str = "MORTALITY_RATE";
pub const VACCINATION_RATE: &str = "VACCINATION_RATE";
pub const UNVACCINATION_RATE: &str = "UNVACCINATION_RATE";
pub const CLUSTER: &str = "CLUSTER";
