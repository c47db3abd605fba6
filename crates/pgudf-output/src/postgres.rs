//! PostgreSQL driver built on `tokio-postgres`.
//!
//! Every round trip on an open connection is bounded by the socket timeout.
//! Batches prepare the call once with explicit parameter types and pipeline
//! one execution per row, so a whole batch costs a single network round trip.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::try_join_all;
use pgudf_page::ColumnType;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, warn};

use crate::driver::{ConnectProperties, Driver, DriverError, RawConnection, SqlParam};

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A round trip that outlived its timeout.
#[derive(Debug, Error)]
#[error("{operation} timed out after {after:?}")]
pub struct TimeoutError {
    pub operation: &'static str,
    pub after: Duration,
}

/// Parameter type the server is told to expect for a column.
pub fn pg_type(column_type: ColumnType) -> Type {
    match column_type {
        ColumnType::Integer64 => Type::INT8,
        ColumnType::Float64 => Type::FLOAT8,
        ColumnType::Boolean => Type::BOOL,
        ColumnType::Text => Type::TEXT,
        ColumnType::Timestamp => Type::TIMESTAMP,
    }
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        let expected = pg_type(self.column_type());
        if *ty != expected {
            return Err(format!("cannot bind a {expected} parameter as {ty}").into());
        }
        match self {
            SqlParam::Null(_) => Ok(IsNull::Yes),
            SqlParam::Int8(value) => value.to_sql(ty, out),
            SqlParam::Float8(value) => value.to_sql(ty, out),
            SqlParam::Bool(value) => value.to_sql(ty, out),
            SqlParam::Text(value) => value.to_sql(ty, out),
            SqlParam::Timestamp(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        [
            Type::INT8,
            Type::FLOAT8,
            Type::BOOL,
            Type::TEXT,
            Type::TIMESTAMP,
        ]
        .contains(ty)
    }

    to_sql_checked!();
}

/// Driver for PostgreSQL servers, without TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    async fn connect(
        &self,
        properties: &ConnectProperties,
    ) -> Result<Box<dyn RawConnection>, DriverError> {
        let mut config = Config::new();
        config
            .host(&properties.host)
            .port(properties.port)
            .dbname(&properties.database)
            .user(&properties.user)
            .password(&properties.password)
            .application_name("pgudf")
            .connect_timeout(properties.login_timeout)
            .keepalives(properties.tcp_keep_alive);

        let (client, connection) =
            bounded(properties.login_timeout, "login", config.connect(NoTls)).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "PostgreSQL connection closed with error");
            }
        });
        debug!(url = %properties.url(), "Opened PostgreSQL connection");

        Ok(Box::new(PostgresConnection {
            client,
            connection_task,
            socket_timeout: properties.socket_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "postgresql"
    }
}

struct PostgresConnection {
    client: Client,
    connection_task: JoinHandle<()>,
    socket_timeout: Duration,
}

#[async_trait]
impl RawConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        bounded(self.socket_timeout, "statement", self.client.batch_execute(sql)).await
    }

    async fn execute_batch(
        &mut self,
        sql: &str,
        types: &[ColumnType],
        rows: &[Vec<SqlParam>],
    ) -> Result<u64, DriverError> {
        let types: Vec<Type> = types.iter().copied().map(pg_type).collect();
        let statement = bounded(
            self.socket_timeout,
            "prepare",
            self.client.prepare_typed(sql, &types),
        )
        .await?;

        let client = &self.client;
        let executions = rows
            .iter()
            .map(|row| client.execute_raw(&statement, row.iter()));
        let counts = bounded(self.socket_timeout, "batch", try_join_all(executions)).await?;
        Ok(counts.into_iter().sum())
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.execute("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.execute("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.execute("ROLLBACK").await
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        let PostgresConnection {
            client,
            mut connection_task,
            ..
        } = *self;
        drop(client);

        match tokio::time::timeout(CLOSE_GRACE, &mut connection_task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.is_cancelled() => Ok(()),
            Ok(Err(err)) => Err(Box::new(err)),
            Err(_) => {
                connection_task.abort();
                Ok(())
            }
        }
    }
}

async fn bounded<T, F>(after: Duration, operation: &'static str, future: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, tokio_postgres::Error>>,
{
    match tokio::time::timeout(after, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(Box::new(TimeoutError { operation, after })),
    }
}
