//! SQL text generation for the load function.
//!
//! DDL cannot take bind parameters, so function definitions are rendered as
//! text. Identifiers derived from the schema always go through
//! [`quote_identifier`]; the function body and language are operator-supplied
//! payload and are inserted verbatim.

use pgudf_page::{ColumnType, Schema};

/// Type name the server rejects, used for column types it cannot represent.
pub const UNKNOWN_TYPE: &str = "unknown";

/// PostgreSQL type name for a column type.
pub fn type_name(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer64 => "bigint",
        ColumnType::Float64 => "float8",
        ColumnType::Boolean => "boolean",
        ColumnType::Text => "text",
        ColumnType::Timestamp => "timestamp",
    }
}

/// PostgreSQL type name for a free-form type label such as `long` or `json`.
///
/// Labels outside the supported set map to [`UNKNOWN_TYPE`] so the failure
/// surfaces as a server-side SQL error.
pub fn type_name_of(label: &str) -> &'static str {
    match label.trim().to_ascii_lowercase().as_str() {
        "long" | "integer64" => type_name(ColumnType::Integer64),
        "double" | "float64" => type_name(ColumnType::Float64),
        "boolean" => type_name(ColumnType::Boolean),
        "string" | "text" => type_name(ColumnType::Text),
        "timestamp" => type_name(ColumnType::Timestamp),
        _ => UNKNOWN_TYPE,
    }
}

pub fn quote_identifier(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{escaped}'")
}

/// Argument name for a column. Unquoted identifiers fold to lower case on the
/// server, so arguments are declared lower-cased.
pub fn argument_name(column_name: &str) -> String {
    column_name.to_lowercase()
}

pub fn set_search_path(namespace: &str) -> String {
    format!("SET search_path TO {}", quote_literal(namespace))
}

/// Statement builder for one load function and its argument schema.
#[derive(Debug, Clone, Copy)]
pub struct FunctionSql<'a> {
    name: &'a str,
    schema: &'a Schema,
}

impl<'a> FunctionSql<'a> {
    pub fn new(name: &'a str, schema: &'a Schema) -> Self {
        Self { name, schema }
    }

    /// `"arg" type, ...` in column order.
    pub fn arguments(&self) -> String {
        self.schema
            .columns()
            .iter()
            .map(|column| {
                format!(
                    "{} {}",
                    quote_identifier(&argument_name(&column.name)),
                    type_name(column.column_type)
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Argument types only, the form `DROP FUNCTION` matches overloads by.
    pub fn signature(&self) -> String {
        self.type_names().join(", ")
    }

    pub fn create(&self, body: &str, language: &str) -> String {
        format!(
            "CREATE OR REPLACE FUNCTION {}({}) RETURNS void AS $$\n{}\n$$ LANGUAGE {}",
            quote_identifier(self.name),
            self.arguments(),
            body,
            language
        )
    }

    pub fn drop_if_exists(&self) -> String {
        format!(
            "DROP FUNCTION IF EXISTS {}({})",
            quote_identifier(self.name),
            self.signature()
        )
    }

    /// Callable-statement template with one cast placeholder per column.
    pub fn call_template(&self) -> String {
        let placeholders: Vec<String> = self
            .type_names()
            .into_iter()
            .map(|type_name| format!("?::{type_name}"))
            .collect();
        format!(
            "{{ call {}({}) }}",
            quote_identifier(self.name),
            placeholders.join(", ")
        )
    }

    /// Wire-protocol form of [`Self::call_template`] with numbered parameters.
    pub fn native_call(&self) -> String {
        let placeholders: Vec<String> = self
            .type_names()
            .into_iter()
            .enumerate()
            .map(|(idx, type_name)| format!("${}::{type_name}", idx + 1))
            .collect();
        format!(
            "SELECT {}({})",
            quote_identifier(self.name),
            placeholders.join(", ")
        )
    }

    fn type_names(&self) -> Vec<&'static str> {
        self.schema
            .columns()
            .iter()
            .map(|column| type_name(column.column_type))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::builder()
            .column("Id", ColumnType::Integer64)
            .column("name", ColumnType::Text)
            .column("created_at", ColumnType::Timestamp)
            .build()
            .unwrap()
    }

    #[test]
    fn test_type_name_is_total() {
        for column_type in ColumnType::ALL {
            let name = type_name(column_type);
            assert!(!name.is_empty());
            assert_ne!(name, UNKNOWN_TYPE);
        }
        assert_eq!(type_name(ColumnType::Float64), "float8");
    }

    #[test]
    fn test_unknown_labels_map_to_sentinel() {
        assert_eq!(type_name_of("json"), UNKNOWN_TYPE);
        assert_eq!(type_name_of(""), UNKNOWN_TYPE);
        assert_eq!(type_name_of(" Long "), "bigint");
        assert_eq!(type_name_of("string"), "text");
    }

    #[test]
    fn test_quote_identifier_doubles_quotes() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("public"), "'public'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_set_search_path() {
        assert_eq!(set_search_path("staging"), "SET search_path TO 'staging'");
    }

    #[test]
    fn test_create_function_lowercases_arguments() {
        let schema = sample_schema();
        let sql = FunctionSql::new("fn_1", &schema).create("BEGIN END;", "plpgsql");
        assert_eq!(
            sql,
            "CREATE OR REPLACE FUNCTION \"fn_1\"(\"id\" bigint, \"name\" text, \"created_at\" timestamp) \
             RETURNS void AS $$\nBEGIN END;\n$$ LANGUAGE plpgsql"
        );
    }

    #[test]
    fn test_drop_uses_type_signature() {
        let schema = sample_schema();
        assert_eq!(
            FunctionSql::new("fn_1", &schema).drop_if_exists(),
            "DROP FUNCTION IF EXISTS \"fn_1\"(bigint, text, timestamp)"
        );
    }

    #[test]
    fn test_call_template_casts_every_parameter() {
        let schema = sample_schema();
        let function = FunctionSql::new("fn_1", &schema);
        assert_eq!(
            function.call_template(),
            "{ call \"fn_1\"(?::bigint, ?::text, ?::timestamp) }"
        );
        assert_eq!(
            function.native_call(),
            "SELECT \"fn_1\"($1::bigint, $2::text, $3::timestamp)"
        );
    }
}
