//! Records and pages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{ColumnType, Schema};
use crate::{Error, Result};

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer64(i64),
    Float64(f64),
    Boolean(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for null and for the variant that belongs to `column_type`.
    pub fn matches(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::Null, _)
                | (Value::Integer64(_), ColumnType::Integer64)
                | (Value::Float64(_), ColumnType::Float64)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Timestamp(_), ColumnType::Timestamp)
        )
    }

    /// Short variant name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer64(_) => "long",
            Value::Float64(_) => "double",
            Value::Boolean(_) => "boolean",
            Value::Text(_) => "string",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Positional values of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    /// Record without schema checks; [`PageBuilder`] validates the records it
    /// collects.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).is_none_or(Value::is_null)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A chunk of records handed to one `add` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    schema: Arc<Schema>,
    records: Vec<Record>,
}

impl Page {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Collects validated records into pages.
#[derive(Debug, Clone)]
pub struct PageBuilder {
    schema: Arc<Schema>,
    records: Vec<Record>,
}

impl PageBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            records: Vec::new(),
        }
    }

    /// Append a record, checking arity and per-column types.
    pub fn add_record<I, V>(&mut self, values: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.len() != self.schema.len() {
            return Err(Error::Arity {
                expected: self.schema.len(),
                found: values.len(),
            });
        }

        for (column, value) in self.schema.columns().iter().zip(&values) {
            if !value.matches(column.column_type) {
                return Err(Error::type_mismatch(
                    column.name.clone(),
                    column.column_type.label(),
                    value.kind(),
                ));
            }
        }

        self.records.push(Record { values });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Hand out the collected records as a page and start over.
    pub fn flush(&mut self) -> Page {
        Page {
            schema: Arc::clone(&self.schema),
            records: std::mem::take(&mut self.records),
        }
    }

    pub fn build(mut self) -> Page {
        self.flush()
    }
}
