use anyhow::Result;
use enum_dispatch::enum_dispatch;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::io::Write;

use crate::table::TabularResult;

/// Trait to define different output generators. Defines two
/// functions, format which generates a serialized string of the
/// `DataFrame` and save which writes the generated output to a writer
#[enum_dispatch]
pub trait OutputGenerator {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()>;
    fn format(&self, df: &mut DataFrame) -> Result<String> {
        // Just creating an empty vec to store the buffered output
        let mut data: Vec<u8> = vec![];
        let mut buff = Cursor::new(&mut data);
        self.save(&mut buff, df)?;

        Ok(String::from_utf8(data)?)
    }
}

/// Enum of OutputFormatters one for each potential
/// output type
#[enum_dispatch(OutputGenerator)]
#[derive(Serialize, Deserialize, Debug)]
pub enum OutputFormatter {
    Csv(CSVFormatter),
    Json(JSONFormatter),
}

/// Format the results as a CSV file with a header row
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct CSVFormatter;

impl OutputGenerator for CSVFormatter {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()> {
        CsvWriter::new(writer).include_header(true).finish(df)?;
        Ok(())
    }
}

/// Format the results as a JSON array of records, one object per row.
/// Dates are written as `YYYY-MM-DD` and undefined values as `null`
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct JSONFormatter {
    pub pretty: bool,
}

impl OutputGenerator for JSONFormatter {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()> {
        let records = TabularResult::from_frame(df.clone()).to_records()?;
        if self.pretty {
            serde_json::to_writer_pretty(&mut *writer, &records)?;
        } else {
            serde_json::to_writer(&mut *writer, &records)?;
        }
        writeln!(writer)?;
        Ok(())
    }
}
