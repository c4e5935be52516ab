//! Command-line overrides of the configuration tree.
//!
//! Grammar, one override per argument:
//!
//! | Form              | Effect                                   |
//! |-------------------|------------------------------------------|
//! | `a.b=value`       | replace an existing key                  |
//! | `+a.b=value`      | add a key that must not exist yet        |
//! | `++a.b=value`     | add or replace                           |
//! | `~a.b`            | delete an existing key                   |
//!
//! Values are read as YAML scalars, so `100` is an integer and `0.2` a float.
//! Values starting with `[` or `{` are YAML flow collections. Everything else,
//! including `download,basic_cleaning`, stays a string.

use serde_json::Value;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    Set,
    Add,
    ForceAdd,
    Delete,
}

/// A single parsed `key=value` override.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub kind: OverrideKind,
    pub key: String,
    pub value: Option<Value>,
}

impl Override {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidOverride {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let (kind, rest) = if let Some(rest) = raw.strip_prefix("++") {
            (OverrideKind::ForceAdd, rest)
        } else if let Some(rest) = raw.strip_prefix('+') {
            (OverrideKind::Add, rest)
        } else if let Some(rest) = raw.strip_prefix('~') {
            (OverrideKind::Delete, rest)
        } else {
            (OverrideKind::Set, raw)
        };

        let (key, value) = match rest.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value)),
            None => (rest.trim(), None),
        };

        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        if key.split('.').any(str::is_empty) {
            return Err(invalid("empty segment in key path"));
        }

        let value = match (kind, value) {
            (OverrideKind::Delete, None) => None,
            (OverrideKind::Delete, Some(_)) => {
                return Err(invalid("delete overrides take no value"));
            }
            (_, None) => return Err(invalid("expected key=value")),
            (_, Some(v)) => Some(parse_value(v).map_err(|e| invalid(&e))?),
        };

        Ok(Self {
            kind,
            key: key.to_string(),
            value,
        })
    }
}

impl std::str::FromStr for Override {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_value(raw: &str) -> Result<Value, String> {
    if raw.is_empty() {
        return Ok(Value::String(String::new()));
    }

    if raw.starts_with('[') || raw.starts_with('{') {
        return serde_yaml::from_str::<Value>(raw).map_err(|e| e.to_string());
    }

    match serde_yaml::from_str::<Value>(raw) {
        Ok(Value::Null) if !is_null_literal(raw) => Ok(Value::String(raw.to_string())),
        Ok(v @ (Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))) => Ok(v),
        _ => Ok(Value::String(raw.to_string())),
    }
}

fn is_null_literal(raw: &str) -> bool {
    matches!(raw.trim(), "null" | "Null" | "NULL" | "~")
}
