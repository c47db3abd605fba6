#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! # pgudf-page
//!
//! Typed schema, record and page structures fed into pgudf loads.
//!
//! A load receives its input as a sequence of [`Page`]s per partition. Every
//! page carries records that match one shared [`Schema`]; the column order of
//! that schema is the argument order of the server-side load function.

/// Record and page containers plus the validating page builder.
pub mod page;
/// Column types, columns and the ordered schema.
pub mod schema;

pub use page::{Page, PageBuilder, Record, Value};
pub use schema::{Column, ColumnType, Schema, SchemaBuilder};

use thiserror::Error;

/// Errors raised while assembling schemas and pages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Record has {found} values but the schema declares {expected} columns")]
    Arity { expected: usize, found: usize },

    #[error("Type mismatch for column '{column}': expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Schema error: {details}")]
    Schema { details: String },
}

impl Error {
    /// Build a schema error with a free-form description.
    pub fn schema(details: impl Into<String>) -> Self {
        Self::Schema {
            details: details.into(),
        }
    }

    /// Build a type mismatch error for one column.
    pub fn type_mismatch(
        column: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            column: column.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Crate-local result type for page operations.
pub type Result<T> = std::result::Result<T, Error>;
