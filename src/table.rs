use std::io::Cursor;

use calamine::{Data, Reader, Xlsx, open_workbook_from_rs};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SparchiveError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub key: String,
    pub name: String,
}

/// Uniform table shape shared by every tabular payload.
///
/// The first sheet row names the columns; keys are positional (`col_0`, `col_1`, ...)
/// so duplicate or blank headers stay unambiguous. Cells past the header width are
/// ignored and cells missing from a short row are `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Map<String, Value>>,
}

impl Table {
    fn from_rows<I>(mut rows: I) -> Self
    where
        I: Iterator<Item = Vec<Value>>,
    {
        let Some(header) = rows.next() else {
            return Self::default();
        };
        let columns: Vec<Column> = header
            .into_iter()
            .enumerate()
            .map(|(index, cell)| Column {
                key: format!("col_{index}"),
                name: header_name(cell),
            })
            .collect();

        let rows = rows
            .map(|row| {
                let mut cells = row.into_iter();
                columns
                    .iter()
                    .map(|column| (column.key.clone(), cells.next().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    /// Parses csv/tsv text. Every cell is kept as a string.
    pub fn from_delimited(content: &[u8], delimiter: u8) -> Result<Self, SparchiveError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(content);
        let records = reader
            .byte_records()
            .map(|record| {
                record
                    .map(|record| {
                        record
                            .iter()
                            .map(|field| Value::String(String::from_utf8_lossy(field).into_owned()))
                            .collect::<Vec<_>>()
                    })
                    .map_err(|err| SparchiveError::ArchiveCorrupt(format!("delimited data: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_rows(records.into_iter()))
    }

    /// Parses an xlsx workbook; only the first sheet is read.
    pub fn from_xlsx(content: &[u8]) -> Result<Self, SparchiveError> {
        let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(content))
            .map_err(|err| SparchiveError::ArchiveCorrupt(format!("xlsx: {err}")))?;
        let range = match workbook.worksheet_range_at(0) {
            Some(range) => {
                range.map_err(|err| SparchiveError::ArchiveCorrupt(format!("xlsx sheet: {err}")))?
            }
            None => return Ok(Self::default()),
        };
        Ok(Self::from_rows(
            range.rows().map(|row| row.iter().map(cell_value).collect()),
        ))
    }
}

fn header_name(cell: Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Int(value) => Value::from(*value),
        Data::Float(value) => serde_json::Number::from_f64(*value)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::Bool(value) => Value::Bool(*value),
        Data::String(text) | Data::DateTimeIso(text) | Data::DurationIso(text) => {
            Value::String(text.clone())
        }
        Data::DateTime(value) => serde_json::Number::from_f64(value.as_f64())
            .map(Value::Number)
            .unwrap_or(Value::Null),
    }
}
