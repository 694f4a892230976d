//! Record types
//!
//! A record is the only unit that flows through step channels: a map from
//! field name to a typed value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Renders the value as plain text, formatting times with `time_layout`
    /// (a chrono strftime pattern); an invalid layout falls back to RFC 3339
    pub fn render(&self, time_layout: &str) -> String {
        match self {
            Value::Time(t) => {
                use std::fmt::Write;
                let mut out = String::new();
                match write!(out, "{}", t.format(time_layout)) {
                    Ok(()) => out,
                    Err(_) => t.to_rfc3339(),
                }
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Time(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

/// A single row moving between steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: HashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_builder_and_lookup() {
        let mut record = Record::new().with("id", 7i64).with("name", "alice");
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("id").and_then(Value::as_i64), Some(7));
        assert_eq!(record.get("name").and_then(Value::as_str), Some("alice"));

        assert_eq!(record.remove("id"), Some(Value::Integer(7)));
        assert!(!record.contains("id"));
    }

    #[test]
    fn test_render_formats_times_with_layout() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 13, 5, 9).unwrap();
        assert_eq!(Value::Time(t).render("%Y%m%dT%H%M%S"), "20240301T130509");
        assert_eq!(Value::Integer(2).render("%Y"), "2");
        assert_eq!(Value::Null.render("%Y"), "");
        assert_eq!(Value::Bytes(b"raw".to_vec()).render("%Y"), "raw");
    }

    #[test]
    fn test_record_from_iterator() {
        let record: Record = vec![("a", Value::Float(1.5)), ("b", Value::Null)]
            .into_iter()
            .collect();
        assert_eq!(record.get("a"), Some(&Value::Float(1.5)));
        assert!(record.get("b").unwrap().is_null());
    }
}
