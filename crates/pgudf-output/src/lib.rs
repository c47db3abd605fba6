#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! # pgudf-output
//!
//! Bulk loads into PostgreSQL through a per-load server-side function.
//!
//! A load creates a uniquely named function whose arguments mirror the record
//! schema, streams every partition's records through calls to that function
//! inside one transaction per partition, and drops the function once all
//! partitions have committed.

pub mod config;
pub mod connection;
pub mod connector;
pub mod driver;
pub mod function_name;
#[cfg(feature = "memory")]
pub mod memory;
pub mod orchestrator;
pub mod postgres;
pub mod sql;

pub use config::{ColumnConfig, LoadConfig};
pub use connection::{ConnectionHandle, PreparedCall};
pub use connector::{Connector, RetryPolicy};
pub use driver::{ConnectProperties, Driver, DriverError, RawConnection, SqlParam};
pub use function_name::FunctionName;
#[cfg(feature = "memory")]
pub use memory::{FunctionCall, FunctionDef, MemoryDatabase, MemoryDriver};
pub use orchestrator::{
    LoadOrchestrator, LoadReport, LoadState, LoadTransaction, PartitionOutput, PartitionReport,
};
pub use postgres::PostgresDriver;

use thiserror::Error;

/// Errors that can occur while loading through a server-side function.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {details}")]
    Config { details: String },

    /// Raised once connection retries are exhausted; displays the first
    /// attempt's underlying error unchanged.
    #[error("{source}")]
    Connection {
        #[source]
        source: DriverError,
    },

    #[error("SQL error executing `{statement}`: {source}")]
    Sql {
        statement: String,
        #[source]
        source: DriverError,
    },

    #[error("{operation} is not supported by the pgudf output")]
    Unsupported { operation: String },

    #[error("Transaction error: {details}")]
    Transaction { details: String },

    #[error("Schema error: {details}")]
    Schema { details: String },

    #[error("Partition {index} failed: {source}")]
    Partition {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Page(#[from] pgudf_page::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn config(details: impl Into<String>) -> Self {
        Self::Config {
            details: details.into(),
        }
    }

    pub fn schema(details: impl Into<String>) -> Self {
        Self::Schema {
            details: details.into(),
        }
    }

    pub fn transaction(details: impl Into<String>) -> Self {
        Self::Transaction {
            details: details.into(),
        }
    }

    pub fn sql(statement: impl Into<String>, source: DriverError) -> Self {
        Self::Sql {
            statement: statement.into(),
            source,
        }
    }

    /// The error a partition actually failed with, past any partition wrapper.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Partition { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
