//! The tabular result shared by the aggregation engine, the visualization adapter and the
//! output formatters.

use chrono::Datelike;
use itertools::Itertools;
use log::debug;
use polars::prelude::*;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{CovidashError, Result};
use crate::warehouse::{RowSet, Scalar, EPOCH_DAYS_FROM_CE};

/// A percentage derived from two raw columns. `Undefined` when the denominator is zero or null,
/// or the ratio is not finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    Defined(f64),
    Undefined,
}

impl Rate {
    pub fn percentage(numerator: Option<f64>, denominator: Option<f64>) -> Self {
        match (numerator, denominator) {
            (Some(n), Some(d)) if d != 0.0 => {
                let rate = n / d * 100.0;
                if rate.is_finite() {
                    Rate::Defined(rate)
                } else {
                    Rate::Undefined
                }
            }
            _ => Rate::Undefined,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Rate::Defined(v) => Some(*v),
            Rate::Undefined => None,
        }
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Rate::Defined(v) => serializer.serialize_f64(*v),
            Rate::Undefined => serializer.serialize_none(),
        }
    }
}

/// Utility function to convert from a warehouse `Scalar` to `serde_json::Value`. Non-finite
/// floats become `null`.
pub fn scalar_to_json(value: &Scalar) -> Value {
    match value {
        Scalar::Null => Value::Null,
        Scalar::Int(n) => json!(*n),
        Scalar::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Scalar::Text(s) => Value::String(s.clone()),
        Scalar::Date(_) => Value::String(value.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnKind {
    Int,
    Float,
    Text,
    Date,
}

impl ColumnKind {
    fn of(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Null => None,
            Scalar::Int(_) => Some(Self::Int),
            Scalar::Float(_) => Some(Self::Float),
            Scalar::Text(_) => Some(Self::Text),
            Scalar::Date(_) => Some(Self::Date),
        }
    }

    /// Integers widen to floats; everything else must agree.
    fn unify(self, other: Self) -> Option<Self> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Self::Int, Self::Float) | (Self::Float, Self::Int) => Some(Self::Float),
            _ => None,
        }
    }
}

fn build_series(name: &str, values: &[Scalar]) -> Result<Series> {
    let kind = values
        .iter()
        .filter_map(ColumnKind::of)
        .try_fold(None, |acc: Option<ColumnKind>, kind| match acc {
            None => Ok(Some(kind)),
            Some(acc) => acc.unify(kind).map(Some).ok_or_else(|| {
                CovidashError::DataIntegrity(format!(
                    "column {name} mixes {acc:?} and {kind:?} values"
                ))
            }),
        })?;

    // Empty and all-null columns carry no type information
    let Some(kind) = kind else {
        return Ok(Series::full_null(name, values.len(), &DataType::Null));
    };
    let series = match kind {
        ColumnKind::Int => Series::new(
            name,
            values
                .iter()
                .map(|v| match v {
                    Scalar::Int(n) => Some(*n),
                    _ => None,
                })
                .collect_vec(),
        ),
        ColumnKind::Float => Series::new(name, values.iter().map(Scalar::as_f64).collect_vec()),
        ColumnKind::Text => Series::new(
            name,
            values
                .iter()
                .map(|v| match v {
                    Scalar::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect_vec(),
        ),
        ColumnKind::Date => Series::new(
            name,
            values
                .iter()
                .map(|v| match v {
                    Scalar::Date(d) => Some(d.num_days_from_ce() - EPOCH_DAYS_FROM_CE),
                    _ => None,
                })
                .collect_vec(),
        )
        .cast(&DataType::Date)?,
    };
    Ok(series)
}

/// Ordered, uniquely named columns of homogeneous values. Columns are either raw (as returned
/// by the query) or derived (computed afterwards); the derived ones are recorded.
#[derive(Debug, Clone)]
pub struct TabularResult {
    frame: DataFrame,
    derived: Vec<String>,
}

impl TabularResult {
    /// Shape warehouse rows into a table with the `expected` columns. The row set's header must
    /// have the same width and names (ignoring case) and every row must have one value per
    /// column.
    pub fn from_rowset(expected: &[&str], rows: RowSet) -> Result<Self> {
        if rows.columns.len() != expected.len()
            || !rows
                .columns
                .iter()
                .zip(expected)
                .all(|(got, want)| got.eq_ignore_ascii_case(want))
        {
            return Err(CovidashError::DataIntegrity(format!(
                "expected columns [{}], got [{}]",
                expected.join(", "),
                rows.columns.join(", ")
            )));
        }
        if let Some((idx, row)) = rows
            .rows
            .iter()
            .find_position(|row| row.len() != expected.len())
        {
            return Err(CovidashError::DataIntegrity(format!(
                "row {idx} has {} values for {} columns",
                row.len(),
                expected.len()
            )));
        }

        let mut columns: Vec<Vec<Scalar>> = vec![Vec::with_capacity(rows.rows.len()); expected.len()];
        for row in rows.rows {
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        let series = expected
            .iter()
            .zip(&columns)
            .map(|(name, values)| build_series(name, values))
            .collect::<Result<Vec<_>>>()?;
        let frame = DataFrame::new(series)?;
        debug!("shaped result with shape {:?}", frame.shape());
        Ok(Self {
            frame,
            derived: vec![],
        })
    }

    pub fn from_frame(frame: DataFrame) -> Self {
        Self {
            frame,
            derived: vec![],
        }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    pub fn column_names(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.column(name).is_ok()
    }

    /// Names of the columns computed after loading, in the order they were added.
    pub fn derived(&self) -> &[String] {
        &self.derived
    }

    fn series(&self, name: &str) -> Result<&Series> {
        self.frame
            .column(name)
            .map_err(|_| CovidashError::DataIntegrity(format!("no column named {name}")))
    }

    /// Stable sort by the given columns, ascending.
    pub fn sort_by(&mut self, columns: &[&str]) -> Result<()> {
        if columns.is_empty() || self.is_empty() {
            return Ok(());
        }
        for column in columns {
            self.series(column)?;
        }
        self.frame = self.frame.sort(
            columns.to_vec(),
            SortMultipleOptions::default().with_maintain_order(true),
        )?;
        Ok(())
    }

    pub fn scalar(&self, row: usize, column: &str) -> Result<Scalar> {
        Scalar::try_from(self.series(column)?.get(row)?)
    }

    pub fn column_values(&self, column: &str) -> Result<Vec<Scalar>> {
        let series = self.series(column)?;
        (0..series.len())
            .map(|idx| Scalar::try_from(series.get(idx)?))
            .collect()
    }

    /// Numeric values of a column, `None` for nulls. Fails for non-numeric columns; a column
    /// holding only nulls reads as all `None`.
    pub fn column_f64(&self, column: &str) -> Result<Vec<Option<f64>>> {
        let series = self.series(column)?;
        if !series.dtype().is_numeric() && series.dtype() != &DataType::Null {
            return Err(CovidashError::DataIntegrity(format!(
                "column {column} is not numeric ({})",
                series.dtype()
            )));
        }
        let values = series.cast(&DataType::Float64)?;
        Ok(values.f64()?.into_iter().collect())
    }

    pub fn column_json(&self, column: &str) -> Result<Vec<Value>> {
        Ok(self.column_values(column)?.iter().map(scalar_to_json).collect())
    }

    /// Append `name = numerator / denominator * 100`. Both inputs must already be columns of
    /// the table.
    pub fn derive_rate(&mut self, name: &str, numerator: &str, denominator: &str) -> Result<()> {
        if self.has_column(name) {
            return Err(CovidashError::DataIntegrity(format!(
                "column {name} already exists"
            )));
        }
        let rates = self
            .column_f64(numerator)?
            .into_iter()
            .zip(self.column_f64(denominator)?)
            .map(|(n, d)| Rate::percentage(n, d).value())
            .collect_vec();
        self.frame.with_column(Series::new(name, rates))?;
        self.derived.push(name.to_string());
        Ok(())
    }

    /// The values of a derived rate column.
    pub fn rates(&self, column: &str) -> Result<Vec<Rate>> {
        Ok(self
            .column_f64(column)?
            .into_iter()
            .map(|v| v.filter(|v| v.is_finite()).map_or(Rate::Undefined, Rate::Defined))
            .collect())
    }

    /// Append a column of labels computed outside the table, one per row.
    pub fn attach_column(&mut self, series: Series) -> Result<()> {
        if series.len() != self.height() {
            return Err(CovidashError::DataIntegrity(format!(
                "column {} has {} values for {} rows",
                series.name(),
                series.len(),
                self.height()
            )));
        }
        let name = series.name().to_string();
        self.frame.with_column(series)?;
        self.derived.push(name);
        Ok(())
    }

    /// One JSON object per row, keyed by column name.
    pub fn to_records(&self) -> Result<Vec<Map<String, Value>>> {
        let columns = self
            .column_names()
            .into_iter()
            .map(|name| Ok((self.column_json(&name)?, name)))
            .collect::<Result<Vec<_>>>()?;
        Ok((0..self.height())
            .map(|idx| {
                columns
                    .iter()
                    .map(|(values, name)| (name.clone(), values[idx].clone()))
                    .collect()
            })
            .collect())
    }

    /// Rows as JSON arrays, in column order.
    pub fn to_rows(&self) -> Result<Vec<Vec<Value>>> {
        let columns = self
            .column_names()
            .iter()
            .map(|name| self.column_json(name))
            .collect::<Result<Vec<_>>>()?;
        Ok((0..self.height())
            .map(|idx| columns.iter().map(|values| values[idx].clone()).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::COL;

    fn date(s: &str) -> Scalar {
        Scalar::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn rows(columns: &[&str], rows: Vec<Vec<Scalar>>) -> RowSet {
        RowSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    fn vaccination_table() -> TabularResult {
        let columns = [COL::DATE, COL::COUNTRY, COL::VACCINATED, COL::POPULATION];
        TabularResult::from_rowset(
            &columns,
            rows(
                &columns,
                vec![
                    vec![date("2021-06-01"), Scalar::Text("Latvia".into()), Scalar::Int(590_000), Scalar::Int(1_900_000)],
                    vec![date("2021-06-01"), Scalar::Text("Nowhere".into()), Scalar::Int(10), Scalar::Int(0)],
                    vec![date("2021-06-01"), Scalar::Text("Unknown".into()), Scalar::Int(10), Scalar::Null],
                ],
            ),
        )
        .unwrap()
    }

    #[test]
    fn rates_should_be_percentages() {
        let mut table = vaccination_table();
        table
            .derive_rate(COL::VACCINATION_RATE, COL::VACCINATED, COL::POPULATION)
            .unwrap();
        let rates = table.rates(COL::VACCINATION_RATE).unwrap();
        match rates[0] {
            Rate::Defined(v) => assert!((v - 590_000.0 / 1_900_000.0 * 100.0).abs() < 1e-9),
            Rate::Undefined => panic!("rate should be defined"),
        }
        assert_eq!(rates[1], Rate::Undefined);
        assert_eq!(rates[2], Rate::Undefined);
        assert_eq!(table.derived(), &[COL::VACCINATION_RATE.to_string()]);
    }

    #[test]
    fn undefined_rates_should_serialize_as_null() {
        let mut table = vaccination_table();
        table
            .derive_rate(COL::VACCINATION_RATE, COL::VACCINATED, COL::POPULATION)
            .unwrap();
        let json = serde_json::to_string(&table.column_json(COL::VACCINATION_RATE).unwrap()).unwrap();
        assert!(json.ends_with(",null,null]"));
        assert!(!json.contains("NaN") && !json.contains("inf"));
        assert_eq!(serde_json::to_string(&Rate::Undefined).unwrap(), "null");
    }

    #[test]
    fn rates_are_not_clamped() {
        assert_eq!(Rate::percentage(Some(3.0), Some(2.0)), Rate::Defined(150.0));
        assert_eq!(Rate::percentage(Some(1.0), Some(0.0)), Rate::Undefined);
        assert_eq!(Rate::percentage(None, Some(2.0)), Rate::Undefined);
    }

    #[test]
    fn derived_column_needs_its_inputs() {
        let mut table = vaccination_table();
        let err = table
            .derive_rate(COL::MORTALITY_RATE, COL::TOTAL_DEATH, COL::TOTAL_CASES)
            .unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));
    }

    #[test]
    fn shape_mismatches_should_fail_integrity() {
        let columns = [COL::COUNTRY, COL::TOTAL_CASES];
        let err = TabularResult::from_rowset(&columns, rows(&[COL::COUNTRY], vec![])).unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));

        let err = TabularResult::from_rowset(
            &columns,
            rows(&columns, vec![vec![Scalar::Text("Latvia".into())]]),
        )
        .unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));

        let err = TabularResult::from_rowset(
            &columns,
            rows(
                &columns,
                vec![
                    vec![Scalar::Text("Latvia".into()), Scalar::Int(1)],
                    vec![Scalar::Text("Estonia".into()), Scalar::Text("many".into())],
                ],
            ),
        )
        .unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));
    }

    #[test]
    fn empty_result_should_derive_empty_rates() {
        let columns = [COL::DATE, COL::COUNTRY, COL::TOTAL_DEATH, COL::TOTAL_CASES];
        let mut table = TabularResult::from_rowset(&columns, rows(&columns, vec![])).unwrap();
        table
            .derive_rate(COL::MORTALITY_RATE, COL::TOTAL_DEATH, COL::TOTAL_CASES)
            .unwrap();
        assert!(table.is_empty());
        assert!(table.rates(COL::MORTALITY_RATE).unwrap().is_empty());
        assert!(table.to_records().unwrap().is_empty());
    }

    #[test]
    fn null_denominator_column_should_give_undefined_rates() {
        let columns = [COL::DATE, COL::COUNTRY, COL::VACCINATED, COL::POPULATION];
        let mut table = TabularResult::from_rowset(
            &columns,
            rows(
                &columns,
                vec![
                    vec![date("2021-06-01"), Scalar::Text("Latvia".into()), Scalar::Int(10), Scalar::Null],
                    vec![date("2021-06-02"), Scalar::Text("Latvia".into()), Scalar::Int(12), Scalar::Null],
                ],
            ),
        )
        .unwrap();
        assert_eq!(table.column_f64(COL::POPULATION).unwrap(), vec![None, None]);
        table
            .derive_rate(COL::VACCINATION_RATE, COL::VACCINATED, COL::POPULATION)
            .unwrap();
        assert_eq!(
            table.rates(COL::VACCINATION_RATE).unwrap(),
            vec![Rate::Undefined, Rate::Undefined]
        );
        assert_eq!(
            table.column_json(COL::VACCINATION_RATE).unwrap(),
            vec![Value::Null, Value::Null]
        );
    }

    #[test]
    fn text_columns_are_not_numeric() {
        let columns = [COL::COUNTRY];
        let table = TabularResult::from_rowset(
            &columns,
            rows(&columns, vec![vec![Scalar::Text("Latvia".into())]]),
        )
        .unwrap();
        assert!(matches!(
            table.column_f64(COL::COUNTRY).unwrap_err(),
            CovidashError::DataIntegrity(_)
        ));
    }

    #[test]
    fn mixed_numbers_should_widen() {
        let columns = [COL::TOTAL_CASES];
        let table = TabularResult::from_rowset(
            &columns,
            rows(&columns, vec![vec![Scalar::Int(1)], vec![Scalar::Float(2.5)], vec![Scalar::Null]]),
        )
        .unwrap();
        assert_eq!(
            table.column_f64(COL::TOTAL_CASES).unwrap(),
            vec![Some(1.0), Some(2.5), None]
        );
    }

    #[test]
    fn sort_should_order_by_date_then_country() {
        let columns = [COL::DATE, COL::COUNTRY];
        let mut table = TabularResult::from_rowset(
            &columns,
            rows(
                &columns,
                vec![
                    vec![date("2021-06-02"), Scalar::Text("Latvia".into())],
                    vec![date("2021-06-01"), Scalar::Text("Latvia".into())],
                    vec![date("2021-06-02"), Scalar::Text("Austria".into())],
                ],
            ),
        )
        .unwrap();
        table.sort_by(&[COL::DATE, COL::COUNTRY]).unwrap();
        let records = table.to_rows().unwrap();
        assert_eq!(
            records,
            vec![
                vec![json!("2021-06-01"), json!("Latvia")],
                vec![json!("2021-06-02"), json!("Austria")],
                vec![json!("2021-06-02"), json!("Latvia")],
            ]
        );
        assert_eq!(table.scalar(0, COL::DATE).unwrap(), date("2021-06-01"));
    }

    #[test]
    fn records_should_be_keyed_by_column() {
        let table = vaccination_table();
        let records = table.to_records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0][COL::COUNTRY], json!("Latvia"));
        assert_eq!(records[0][COL::DATE], json!("2021-06-01"));
        assert_eq!(records[2][COL::POPULATION], Value::Null);
    }
}
