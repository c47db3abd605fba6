//! In-memory stand-in for a PostgreSQL server.
//!
//! Understands exactly the statements the load protocol generates: search
//! path selection, function create/drop and batched function calls. Calls made
//! inside a transaction only become visible on commit. Failures can be injected
//! for connects, individual call parameters and statement text.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use pgudf_page::ColumnType;
use regex::Regex;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::driver::{ConnectProperties, Driver, DriverError, RawConnection, SqlParam};
use crate::sql::type_name;

const DEFAULT_NAMESPACE: &str = "public";

static SET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^SET search_path TO '((?:[^']|'')*)'$"));
static CREATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r#"(?s)^CREATE OR REPLACE FUNCTION "((?:[^"]|"")+)"\((.*?)\) RETURNS void AS \$\$\n(.*)\n\$\$ LANGUAGE (\S+)$"#,
    )
});
static DROP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| compile(r#"^DROP FUNCTION IF EXISTS "((?:[^"]|"")+)"\((.*)\)$"#));
static CALL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| compile(r#"^SELECT "((?:[^"]|"")+)"\((.*)\)$"#));
static ARGUMENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| compile(r#""((?:[^"]|"")*)" (\w+)"#));
static CAST_PATTERN: LazyLock<Regex> = LazyLock::new(|| compile(r"\$(\d+)::(\w+)"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid statement pattern: {err}"))
}

/// Error reported by the in-memory server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct MemoryError {
    message: String,
}

impl MemoryError {
    fn new(message: impl Into<String>) -> DriverError {
        Box::new(Self {
            message: message.into(),
        })
    }
}

/// A function as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub namespace: String,
    pub name: String,
    pub argument_names: Vec<String>,
    pub argument_types: Vec<String>,
    pub body: String,
    pub language: String,
}

/// One committed invocation of a catalog function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: String,
    pub connection: usize,
    pub params: Vec<SqlParam>,
}

type FunctionKey = (String, String, Vec<String>);

/// Server state shared by every connection of a [`MemoryDriver`].
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    functions: BTreeMap<FunctionKey, FunctionDef>,
    calls: Vec<FunctionCall>,
    statements: Vec<String>,
    connect_attempts: usize,
    pending_connect_failures: usize,
    connect_failure_message: String,
    batch_executions: usize,
    open_connections: usize,
    next_connection: usize,
    poison: Option<SqlParam>,
    failing_fragment: Option<String>,
}

impl MemoryDatabase {
    pub fn functions(&self) -> Vec<&FunctionDef> {
        self.functions.values().collect()
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.values().find(|def| def.name == name)
    }

    /// Committed calls in commit order.
    pub fn calls(&self) -> &[FunctionCall] {
        &self.calls
    }

    /// Every statement received, in arrival order.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts
    }

    pub fn batch_executions(&self) -> usize {
        self.batch_executions
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections
    }

    fn injected_failure(&self, sql: &str) -> Option<DriverError> {
        self.failing_fragment
            .as_deref()
            .filter(|fragment| sql.contains(fragment))
            .map(|fragment| MemoryError::new(format!("injected failure for statement containing '{fragment}'")))
    }
}

/// Driver whose connections talk to a shared [`MemoryDatabase`].
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    database: Arc<Mutex<MemoryDatabase>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail with `message`.
    pub async fn fail_next_connects(&self, count: usize, message: impl Into<String>) {
        let mut db = self.database.lock().await;
        db.pending_connect_failures = count;
        db.connect_failure_message = message.into();
    }

    /// Fail any batch that carries `param`.
    pub async fn fail_calls_with(&self, param: SqlParam) {
        self.database.lock().await.poison = Some(param);
    }

    /// Fail any plain statement containing `fragment`.
    pub async fn fail_statements_containing(&self, fragment: impl Into<String>) {
        self.database.lock().await.failing_fragment = Some(fragment.into());
    }

    /// Run `inspect` against the current server state.
    pub async fn inspect<R>(&self, inspect: impl FnOnce(&MemoryDatabase) -> R) -> R {
        let db = self.database.lock().await;
        inspect(&db)
    }

    pub async fn calls(&self) -> Vec<FunctionCall> {
        self.inspect(|db| db.calls().to_vec()).await
    }

    pub async fn statements(&self) -> Vec<String> {
        self.inspect(|db| db.statements().to_vec()).await
    }

    pub async fn function(&self, name: &str) -> Option<FunctionDef> {
        self.inspect(|db| db.function(name).cloned()).await
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(
        &self,
        _properties: &ConnectProperties,
    ) -> Result<Box<dyn RawConnection>, DriverError> {
        let mut db = self.database.lock().await;
        db.connect_attempts += 1;
        if db.pending_connect_failures > 0 {
            db.pending_connect_failures -= 1;
            return Err(MemoryError::new(format!(
                "{} (attempt {})",
                db.connect_failure_message, db.connect_attempts
            )));
        }

        db.open_connections += 1;
        db.next_connection += 1;
        Ok(Box::new(MemoryConnection {
            id: db.next_connection,
            database: Arc::clone(&self.database),
            search_path: DEFAULT_NAMESPACE.to_string(),
            transaction: None,
            aborted: false,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    id: usize,
    database: Arc<Mutex<MemoryDatabase>>,
    search_path: String,
    transaction: Option<Vec<FunctionCall>>,
    aborted: bool,
}

impl MemoryConnection {
    fn ensure_usable(&self) -> Result<(), DriverError> {
        if self.aborted {
            return Err(MemoryError::new(
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        Ok(())
    }

    fn fail(&mut self, err: DriverError) -> DriverError {
        if self.transaction.is_some() {
            self.aborted = true;
        }
        err
    }
}

#[async_trait]
impl RawConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        let database = Arc::clone(&self.database);
        let mut db = database.lock().await;
        db.statements.push(sql.to_string());
        self.ensure_usable()?;
        if let Some(err) = db.injected_failure(sql) {
            return Err(self.fail(err));
        }

        if let Some(captures) = SET_PATTERN.captures(sql) {
            self.search_path = captures[1].replace("''", "'");
            return Ok(());
        }

        if let Some(captures) = CREATE_PATTERN.captures(sql) {
            let name = unquote(&captures[1]);
            let mut argument_names = Vec::new();
            let mut argument_types = Vec::new();
            for argument in ARGUMENT_PATTERN.captures_iter(&captures[2]) {
                let argument_type = argument[2].to_string();
                let supported = ColumnType::ALL
                    .iter()
                    .any(|column_type| type_name(*column_type) == argument_type);
                if !supported {
                    return Err(self.fail(MemoryError::new(format!(
                        "functions cannot accept type {argument_type}"
                    ))));
                }
                argument_names.push(unquote(&argument[1]));
                argument_types.push(argument_type);
            }
            let def = FunctionDef {
                namespace: self.search_path.clone(),
                name: name.clone(),
                argument_names,
                argument_types: argument_types.clone(),
                body: captures[3].to_string(),
                language: captures[4].to_string(),
            };
            db.functions
                .insert((self.search_path.clone(), name, argument_types), def);
            return Ok(());
        }

        if let Some(captures) = DROP_PATTERN.captures(sql) {
            let argument_types: Vec<String> = captures[2]
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            let key = (
                self.search_path.clone(),
                unquote(&captures[1]),
                argument_types,
            );
            db.functions.remove(&key);
            return Ok(());
        }

        let token = sql.split_whitespace().next().unwrap_or_default();
        Err(self.fail(MemoryError::new(format!(
            "syntax error at or near \"{token}\""
        ))))
    }

    async fn execute_batch(
        &mut self,
        sql: &str,
        types: &[ColumnType],
        rows: &[Vec<SqlParam>],
    ) -> Result<u64, DriverError> {
        let database = Arc::clone(&self.database);
        let mut db = database.lock().await;
        db.statements.push(sql.to_string());
        db.batch_executions += 1;
        self.ensure_usable()?;

        let Some(captures) = CALL_PATTERN.captures(sql) else {
            return Err(self.fail(MemoryError::new(format!("not a function call: {sql}"))));
        };
        let name = unquote(&captures[1]);
        let casts: Vec<String> = CAST_PATTERN
            .captures_iter(&captures[2])
            .map(|cast| cast[2].to_string())
            .collect();

        let declared: Vec<&str> = types.iter().map(|ty| type_name(*ty)).collect();
        if declared != casts {
            return Err(self.fail(MemoryError::new(format!(
                "parameter types ({}) do not match casts ({})",
                declared.join(", "),
                casts.join(", ")
            ))));
        }

        let key = (self.search_path.clone(), name.clone(), casts);
        if !db.functions.contains_key(&key) {
            return Err(self.fail(MemoryError::new(format!(
                "function {}({}) does not exist",
                name,
                key.2.join(", ")
            ))));
        }

        for row in rows {
            if row.len() != types.len() {
                return Err(self.fail(MemoryError::new(format!(
                    "bind message supplies {} parameters, but prepared statement requires {}",
                    row.len(),
                    types.len()
                ))));
            }
            let mismatched = row
                .iter()
                .zip(types)
                .any(|(param, ty)| param.column_type() != *ty);
            if mismatched {
                return Err(self.fail(MemoryError::new("incorrect binary data format in bind parameter")));
            }
            if let Some(poison) = db.poison.as_ref().filter(|poison| row.contains(poison)) {
                let message = format!("injected failure for parameter {poison:?}");
                return Err(self.fail(MemoryError::new(message)));
            }
        }

        let calls = rows.iter().map(|row| FunctionCall {
            function: name.clone(),
            connection: self.id,
            params: row.clone(),
        });
        match self.transaction.as_mut() {
            Some(pending) => pending.extend(calls),
            None => db.calls.extend(calls),
        }
        Ok(rows.len() as u64)
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.database.lock().await.statements.push("BEGIN".to_string());
        if self.transaction.is_none() {
            self.transaction = Some(Vec::new());
            self.aborted = false;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        let mut db = self.database.lock().await;
        db.statements.push("COMMIT".to_string());
        let pending = self.transaction.take().unwrap_or_default();
        if !std::mem::take(&mut self.aborted) {
            db.calls.extend(pending);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.database
            .lock()
            .await
            .statements
            .push("ROLLBACK".to_string());
        self.transaction = None;
        self.aborted = false;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        let mut db = self.database.lock().await;
        db.open_connections = db.open_connections.saturating_sub(1);
        Ok(())
    }
}

fn unquote(identifier: &str) -> String {
    identifier.replace("\"\"", "\"")
}
