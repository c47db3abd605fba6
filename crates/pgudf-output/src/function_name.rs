//! Per-load function identity.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::{Error, Result};

const PREFIX: &str = "fn_";

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^fn_[0-9a-f]{24}$").unwrap_or_else(|err| panic!("invalid name pattern: {err}"))
});

/// Name of the server-side function backing one load.
///
/// Computed once from the load's transaction time and passed to every
/// partition and to the cleanup step; never recomputed per partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FunctionName(String);

impl FunctionName {
    /// `fn_` followed by 16 hex digits of seconds and 8 hex digits of nanos.
    pub fn new(epoch_seconds: i64, nanos: u32) -> Self {
        Self(format!("{PREFIX}{epoch_seconds:016x}{nanos:08x}"))
    }

    pub fn from_transaction_time(time: DateTime<Utc>) -> Self {
        Self::new(time.timestamp(), time.timestamp_subsec_nanos())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FunctionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for FunctionName {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        if NAME_PATTERN.is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::config(format!(
                "'{value}' is not a load function name (expected fn_ followed by 24 lowercase hex digits)"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_name_encodes_seconds_and_nanos() {
        let name = FunctionName::new(0x1122_3344_5566_7788, 0x99aa_bbcc);
        assert_eq!(name.as_str(), "fn_112233445566778899aabbcc");
        assert_eq!(name, FunctionName::new(0x1122_3344_5566_7788, 0x99aa_bbcc));
    }

    #[test]
    fn test_name_is_zero_padded() {
        let name = FunctionName::new(1, 2);
        assert_eq!(name.as_str(), "fn_000000000000000100000002");
        assert_eq!(name.as_str().len(), PREFIX.len() + 24);
    }

    #[test]
    fn test_name_from_transaction_time() {
        let time = Utc.timestamp_opt(1_426_896_000, 123_456_789).unwrap();
        let name = FunctionName::from_transaction_time(time);
        assert_eq!(name.as_str(), "fn_00000000550cb480075bcd15");
        assert_eq!(FunctionName::from_transaction_time(time), name);
    }

    #[test]
    fn test_parse_round_trips_generated_names() {
        let name = FunctionName::new(0x55, 7);
        let parsed: FunctionName = name.as_str().parse().unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!("fn_123".parse::<FunctionName>().is_err());
        assert!("drop_table_users".parse::<FunctionName>().is_err());
        assert!(
            "fn_112233445566778899AABBCC"
                .parse::<FunctionName>()
                .is_err()
        );
    }
}
