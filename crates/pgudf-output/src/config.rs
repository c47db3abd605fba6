//! Load task configuration.

use std::fmt;
use std::path::Path;

use pgudf_page::{ColumnType, Schema};
use serde::{Deserialize, Serialize};

use crate::driver::ConnectProperties;
use crate::{Error, Result};

/// Settings for one load.
///
/// The function name is generated per load and cannot be set here. Batch
/// sizing and free-form driver options are not accepted either; unknown keys
/// are rejected.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Namespace the session's search path is set to.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Body of the generated function.
    pub function: String,
    /// Procedural language of the function body.
    #[serde(default = "default_language")]
    pub language: String,
    /// Input columns, in argument order. Only needed by runners that build
    /// pages from untyped input.
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
}

/// One declared input column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_language() -> String {
    "plpgsql".to_string()
}

impl LoadConfig {
    /// Parse and validate a YAML task document.
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&document)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("host", &self.host),
            ("user", &self.user),
            ("database", &self.database),
            ("function", &self.function),
            ("language", &self.language),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(Error::config(format!("'{key}' must not be empty")));
            }
        }
        if self.port == 0 {
            return Err(Error::config("'port' must be greater than zero"));
        }
        Ok(())
    }

    /// Connection settings with the fixed login/socket timeouts and keep-alive.
    pub fn connect_properties(&self) -> ConnectProperties {
        ConnectProperties::new(
            self.host.clone(),
            self.port,
            self.database.clone(),
            self.user.clone(),
            self.password.clone(),
        )
    }

    /// Namespace to select on every new session, if any.
    pub fn namespace(&self) -> Option<&str> {
        let schema = self.schema.trim();
        (!schema.is_empty()).then_some(schema)
    }

    /// Record schema built from `columns`.
    pub fn record_schema(&self) -> Result<Schema> {
        if self.columns.is_empty() {
            return Err(Error::config("'columns' must declare at least one column"));
        }
        let schema = Schema::new(
            self.columns
                .iter()
                .map(|column| (column.name.clone(), column.column_type)),
        )?;
        Ok(schema)
    }

    pub fn url(&self) -> String {
        self.connect_properties().url()
    }
}

impl fmt::Debug for LoadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("function", &self.function)
            .field("language", &self.language)
            .field("columns", &self.columns)
            .finish()
    }
}
