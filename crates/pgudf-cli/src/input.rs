//! CSV files as partitions of pages.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDateTime, Utc};
use pgudf_page::{ColumnType, Page, PageBuilder, Schema, Value};

/// Records handed to each `add` call.
pub const PAGE_SIZE: usize = 1000;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Read one CSV file as one partition.
pub fn read_partition(path: &Path, schema: &Arc<Schema>) -> Result<Vec<Page>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open input {}", path.display()))?;
    read_pages(file, schema, PAGE_SIZE).with_context(|| format!("invalid input {}", path.display()))
}

/// Split CSV `input` into pages of at most `page_size` records.
///
/// The header row must name every schema column; extra columns are ignored and
/// empty cells are null.
pub fn read_pages<R: Read>(input: R, schema: &Arc<Schema>, page_size: usize) -> Result<Vec<Page>> {
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader.headers()?.clone();
    let positions = schema
        .columns()
        .iter()
        .map(|column| {
            headers
                .iter()
                .position(|header| header.trim().eq_ignore_ascii_case(&column.name))
                .ok_or_else(|| anyhow!("missing column '{}' in header", column.name))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut pages = Vec::new();
    let mut builder = PageBuilder::new(Arc::clone(schema));
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row + 2;
        let values = schema
            .columns()
            .iter()
            .zip(&positions)
            .map(|(column, position)| {
                let cell = record.get(*position).unwrap_or_default();
                parse_cell(cell, column.column_type)
                    .with_context(|| format!("line {line}, column '{}'", column.name))
            })
            .collect::<Result<Vec<_>>>()?;
        builder.add_record(values)?;
        if builder.len() >= page_size.max(1) {
            pages.push(builder.flush());
        }
    }
    if !builder.is_empty() {
        pages.push(builder.build());
    }
    Ok(pages)
}

fn parse_cell(cell: &str, column_type: ColumnType) -> Result<Value> {
    if cell.is_empty() {
        return Ok(Value::Null);
    }
    let value = match column_type {
        ColumnType::Integer64 => Value::Integer64(cell.trim().parse()?),
        ColumnType::Float64 => Value::Float64(cell.trim().parse()?),
        ColumnType::Boolean => match cell.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            other => bail!("'{other}' is not a boolean"),
        },
        ColumnType::Text => Value::Text(cell.to_string()),
        ColumnType::Timestamp => Value::Timestamp(parse_timestamp(cell.trim())?),
    };
    Ok(value)
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .with_context(|| format!("'{text}' is not a timestamp"))?;
    Ok(naive.and_utc())
}
