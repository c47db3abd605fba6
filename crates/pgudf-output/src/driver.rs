//! Driver seam between the load protocol and a concrete database client.
//!
//! The [`Connector`](crate::Connector) receives its [`Driver`] as a constructed
//! value, so tests can substitute a driver that fails on demand.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use pgudf_page::ColumnType;

/// Error produced by a driver, passed through unchanged.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Login timeout applied to every connection attempt.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound for any single round trip on an established connection.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(28_800);

/// Everything a driver needs to open one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectProperties {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub login_timeout: Duration,
    pub socket_timeout: Duration,
    pub tcp_keep_alive: bool,
}

impl ConnectProperties {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
            login_timeout: LOGIN_TIMEOUT,
            socket_timeout: SOCKET_TIMEOUT,
            tcp_keep_alive: true,
        }
    }

    /// Connection URL without credentials, for logs.
    pub fn url(&self) -> String {
        format!("postgresql://{}:{}/{}", self.host, self.port, self.database)
    }
}

impl fmt::Debug for ConnectProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectProperties")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("login_timeout", &self.login_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("tcp_keep_alive", &self.tcp_keep_alive)
            .finish()
    }
}

/// One bound call parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// Null carrying the column type it stands in for.
    Null(ColumnType),
    Int8(i64),
    Float8(f64),
    Bool(bool),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl SqlParam {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlParam::Null(_))
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            SqlParam::Null(column_type) => *column_type,
            SqlParam::Int8(_) => ColumnType::Integer64,
            SqlParam::Float8(_) => ColumnType::Float64,
            SqlParam::Bool(_) => ColumnType::Boolean,
            SqlParam::Text(_) => ColumnType::Text,
            SqlParam::Timestamp(_) => ColumnType::Timestamp,
        }
    }
}

/// Opens raw connections.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(
        &self,
        properties: &ConnectProperties,
    ) -> Result<Box<dyn RawConnection>, DriverError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// A live database session.
///
/// Outside of [`begin`](Self::begin)/[`commit`](Self::commit) every statement
/// commits on its own.
#[async_trait]
pub trait RawConnection: Send {
    /// Run one statement without parameters.
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Run `sql` once per row of parameters in a single round trip.
    async fn execute_batch(
        &mut self,
        sql: &str,
        types: &[ColumnType],
        rows: &[Vec<SqlParam>],
    ) -> Result<u64, DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}
