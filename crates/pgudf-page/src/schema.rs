//! Column types and the ordered load schema.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Abstract column type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 64-bit signed integer
    #[serde(rename = "long", alias = "integer64")]
    Integer64,

    /// 64-bit floating point
    #[serde(rename = "double", alias = "float64")]
    Float64,

    /// Boolean flag
    Boolean,

    /// UTF-8 text
    #[serde(rename = "string", alias = "text")]
    Text,

    /// Point in time (UTC)
    Timestamp,
}

impl ColumnType {
    /// All variants, in declaration order.
    pub const ALL: [ColumnType; 5] = [
        ColumnType::Integer64,
        ColumnType::Float64,
        ColumnType::Boolean,
        ColumnType::Text,
        ColumnType::Timestamp,
    ];

    /// Name used in configuration files.
    pub fn label(self) -> &'static str {
        match self {
            ColumnType::Integer64 => "long",
            ColumnType::Float64 => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "string",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One named, typed column at a fixed position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub index: usize,
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(index: usize, name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            index,
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column list shared by every page of a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Build a schema from `(name, type)` pairs, assigning positions in order.
    ///
    /// Fails when the list is empty or when two names collide after
    /// lower-casing, since the load function declares its arguments with
    /// lower-cased names.
    pub fn new<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        let columns: Vec<Column> = columns
            .into_iter()
            .enumerate()
            .map(|(index, (name, column_type))| Column::new(index, name, column_type))
            .collect();

        if columns.is_empty() {
            return Err(Error::schema("schema must declare at least one column"));
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(Error::schema(format!(
                    "column at position {} has an empty name",
                    column.index
                )));
            }
            if !seen.insert(column.name.to_lowercase()) {
                return Err(Error::schema(format!(
                    "duplicate column name '{}' (names are compared case-insensitively)",
                    column.name
                )));
            }
        }

        Ok(Self { columns })
    }

    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Column types in positional order.
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|column| column.column_type).collect()
    }
}

/// Incremental schema construction.
#[derive(Debug, Default, Clone)]
pub struct SchemaBuilder {
    columns: Vec<(String, ColumnType)>,
}

impl SchemaBuilder {
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push((name.into(), column_type));
        self
    }

    pub fn build(self) -> Result<Schema> {
        Schema::new(self.columns)
    }
}
