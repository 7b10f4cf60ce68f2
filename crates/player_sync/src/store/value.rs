use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single statement parameter or stored plugin value.
///
/// Statements take a slice of these instead of untyped arguments; each SQL
/// backend binds them through an exhaustive match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreValue {
    Str(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Null,
}

impl StoreValue {
    /// The `data_type` tag used by the plugin data table.
    ///
    /// Timestamps are stored as RFC 3339 strings and read back as [`StoreValue::Str`].
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Str(_) | Self::Timestamp(_) | Self::Null => "STRING",
            Self::Int(_) => "INT",
            Self::Long(_) => "LONG",
            Self::Double(_) => "DOUBLE",
            Self::Bool(_) => "BOOLEAN",
            Self::Json(_) => "JSON",
        }
    }

    /// Text form stored in the plugin data table, `None` for [`StoreValue::Null`].
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Int(v) => Some(v.to_string()),
            Self::Long(v) => Some(v.to_string()),
            Self::Double(v) => Some(v.to_string()),
            Self::Bool(v) => Some(v.to_string()),
            Self::Timestamp(t) => Some(t.to_rfc3339()),
            Self::Json(v) => Some(v.to_string()),
            Self::Null => None,
        }
    }

    /// Rebuilds a value from its stored text and type tag.
    pub fn from_tagged(type_tag: &str, text: Option<String>) -> Result<Self, StoreError> {
        let Some(text) = text else {
            return Ok(Self::Null);
        };

        let invalid = |e: &dyn std::fmt::Display| {
            StoreError::Decode(format!("'{text}' is not a valid {type_tag}: {e}"))
        };

        match type_tag {
            "STRING" => Ok(Self::Str(text.clone())),
            "INT" => text.parse().map(Self::Int).map_err(|e| invalid(&e)),
            "LONG" => text.parse().map(Self::Long).map_err(|e| invalid(&e)),
            "DOUBLE" => text.parse().map(Self::Double).map_err(|e| invalid(&e)),
            "BOOLEAN" => text.parse().map(Self::Bool).map_err(|e| invalid(&e)),
            "JSON" => serde_json::from_str(&text)
                .map(Self::Json)
                .map_err(|e| invalid(&e)),
            other => Err(StoreError::Decode(format!("unknown data type tag '{other}'"))),
        }
    }
}

impl From<&str> for StoreValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for StoreValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i32> for StoreValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for StoreValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for StoreValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for StoreValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for StoreValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<StoreValue>> From<Option<T>> for StoreValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
