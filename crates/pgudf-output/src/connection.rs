//! A single database session used by the load protocol.

use pgudf_page::{ColumnType, Record, Schema, Value};
use tracing::{info, warn};

use crate::driver::{RawConnection, SqlParam};
use crate::sql::{FunctionSql, set_search_path};
use crate::{Error, Result};

/// Owns one raw connection in a fixed commit mode.
///
/// In manual-commit mode a transaction is opened lazily by the first flush, so
/// the handle stays usable after [`commit`](Self::commit) or
/// [`rollback`](Self::rollback).
pub struct ConnectionHandle {
    raw: Box<dyn RawConnection>,
    auto_commit: bool,
    in_transaction: bool,
}

impl ConnectionHandle {
    /// Wrap `raw`, selecting `namespace` as the search path when given. The raw
    /// connection is closed if that fails.
    pub async fn open(
        raw: Box<dyn RawConnection>,
        auto_commit: bool,
        namespace: Option<&str>,
    ) -> Result<Self> {
        let mut handle = Self {
            raw,
            auto_commit,
            in_transaction: false,
        };
        if let Some(namespace) = namespace {
            if let Err(err) = handle.execute(&set_search_path(namespace)).await {
                if let Err(close_err) = handle.raw.close().await {
                    warn!(error = %close_err, "Failed to close connection after setup error");
                }
                return Err(err);
            }
        }
        Ok(handle)
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub async fn create_function(
        &mut self,
        name: &str,
        schema: &Schema,
        body: &str,
        language: &str,
    ) -> Result<()> {
        let sql = FunctionSql::new(name, schema).create(body, language);
        self.execute(&sql).await
    }

    pub async fn drop_function(&mut self, name: &str, schema: &Schema) -> Result<()> {
        let sql = FunctionSql::new(name, schema).drop_if_exists();
        self.execute(&sql).await
    }

    pub fn prepare_call(&self, name: &str, schema: &Schema) -> PreparedCall {
        let function = FunctionSql::new(name, schema);
        let template = function.call_template();
        info!("SQL: {template}");
        PreparedCall {
            function: name.to_string(),
            template,
            native_sql: function.native_call(),
            column_types: schema.column_types(),
            rows: Vec::new(),
        }
    }

    /// Send every queued row of `call` in one round trip.
    pub async fn execute_batch(&mut self, call: &mut PreparedCall) -> Result<u64> {
        if call.rows.is_empty() {
            return Ok(0);
        }
        if !self.auto_commit && !self.in_transaction {
            self.raw
                .begin()
                .await
                .map_err(|source| Error::sql("BEGIN", source))?;
            self.in_transaction = true;
        }
        let count = self
            .raw
            .execute_batch(&call.native_sql, &call.column_types, &call.rows)
            .await
            .map_err(|source| Error::sql(call.template.clone(), source))?;
        call.rows.clear();
        Ok(count)
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_manual("commit")?;
        if std::mem::take(&mut self.in_transaction) {
            self.raw
                .commit()
                .await
                .map_err(|source| Error::sql("COMMIT", source))?;
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_manual("rollback")?;
        if std::mem::take(&mut self.in_transaction) {
            self.raw
                .rollback()
                .await
                .map_err(|source| Error::sql("ROLLBACK", source))?;
        }
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.raw
            .close()
            .await
            .map_err(|source| Error::transaction(format!("failed to close connection: {source}")))
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        info!("SQL: {sql}");
        self.raw
            .execute(sql)
            .await
            .map_err(|source| Error::sql(sql, source))
    }

    fn ensure_manual(&self, operation: &str) -> Result<()> {
        if self.auto_commit {
            return Err(Error::transaction(format!(
                "cannot {operation} a connection in autocommit mode"
            )));
        }
        Ok(())
    }
}

/// A prepared call to the load function with its queue of bound rows.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    function: String,
    template: String,
    native_sql: String,
    column_types: Vec<ColumnType>,
    rows: Vec<Vec<SqlParam>>,
}

impl PreparedCall {
    pub fn function(&self) -> &str {
        &self.function
    }

    /// `{ call ... }` form of the statement.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    /// Bind `record` positionally and queue it.
    pub fn bind_record(&mut self, record: &Record) -> Result<()> {
        if record.len() != self.column_types.len() {
            return Err(Error::schema(format!(
                "record has {} values but {} takes {} arguments",
                record.len(),
                self.function,
                self.column_types.len()
            )));
        }
        let row = record
            .values()
            .iter()
            .zip(&self.column_types)
            .enumerate()
            .map(|(index, (value, column_type))| bind_value(index, value, *column_type))
            .collect::<Result<Vec<_>>>()?;
        self.rows.push(row);
        Ok(())
    }

    /// Rows bound since the last successful flush.
    pub fn queued(&self) -> usize {
        self.rows.len()
    }
}

fn bind_value(index: usize, value: &Value, column_type: ColumnType) -> Result<SqlParam> {
    let param = match (value, column_type) {
        (Value::Null, _) => SqlParam::Null(column_type),
        (Value::Integer64(v), ColumnType::Integer64) => SqlParam::Int8(*v),
        (Value::Float64(v), ColumnType::Float64) => SqlParam::Float8(*v),
        (Value::Boolean(v), ColumnType::Boolean) => SqlParam::Bool(*v),
        (Value::Text(v), ColumnType::Text) => SqlParam::Text(v.clone()),
        (Value::Timestamp(v), ColumnType::Timestamp) => SqlParam::Timestamp(v.naive_utc()),
        (other, _) => {
            return Err(Error::schema(format!(
                "column {index} expects {column_type}, got {}",
                other.kind()
            )));
        }
    };
    Ok(param)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn schema() -> Schema {
        Schema::builder()
            .column("id", ColumnType::Integer64)
            .column("name", ColumnType::Text)
            .column("at", ColumnType::Timestamp)
            .build()
            .unwrap()
    }

    fn call() -> PreparedCall {
        let schema = schema();
        let function = FunctionSql::new("fn_1", &schema);
        PreparedCall {
            function: "fn_1".to_string(),
            template: function.call_template(),
            native_sql: function.native_call(),
            column_types: schema.column_types(),
            rows: Vec::new(),
        }
    }

    #[test]
    fn test_null_binds_as_typed_null() {
        let at = Utc.with_ymd_and_hms(2015, 3, 21, 0, 0, 0).unwrap();
        let record = Record::new(vec![Value::from(7_i64), Value::Null, Value::from(at)]);
        let mut call = call();
        call.bind_record(&record).unwrap();
        assert_eq!(call.queued(), 1);
        assert_eq!(
            call.rows[0],
            vec![
                SqlParam::Int8(7),
                SqlParam::Null(ColumnType::Text),
                SqlParam::Timestamp(at.naive_utc()),
            ]
        );
    }

    #[test]
    fn test_mismatched_value_is_a_schema_error() {
        let record = Record::new(vec![
            Value::from("seven"),
            Value::Null,
            Value::Null,
        ]);
        let mut call = call();
        let err = call.bind_record(&record).unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
        assert_eq!(call.queued(), 0);
    }

    #[test]
    fn test_wrong_arity_is_a_schema_error() {
        let record = Record::new(vec![Value::from(1_i64)]);
        let err = call().bind_record(&record).unwrap_err();
        assert!(err.to_string().contains("takes 3 arguments"));
    }
}
