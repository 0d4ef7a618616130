// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Column values, column types and timestamp helpers.
//!
//! Values never fail to coerce: anything that does not fit the declared column type
//! becomes that type's zero value.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Commit timestamp of a row.
pub type Timestamp = DateTime<Utc>;

/// A committed or pending row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// Longest accepted node id or column name.
pub const MAX_IDENTIFIER_LEN: usize = 48;

/// Truncate a timestamp to the microsecond precision both SQL backends store.
pub fn truncate_micros(ts: Timestamp) -> Timestamp {
    ts.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(ts)
}

/// Convert a timestamp to microseconds since the Unix epoch.
pub fn to_micros(ts: Timestamp) -> i64 {
    ts.timestamp_micros()
}

/// Convert microseconds since the Unix epoch back into a timestamp.
pub fn from_micros(micros: i64) -> Timestamp {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// Integer value (all integer widths).
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Text value.
    Text(String),
}

impl Value {
    /// Read the value as a float, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Read the value as an integer, if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read the value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read the value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert this value to the representation of `ty`.
    ///
    /// Falls back to `ty.zero()` when no sensible conversion exists.
    pub fn coerce(self, ty: ColumnType) -> Value {
        match (ty, self) {
            (ColumnType::Boolean, Value::Bool(b)) => Value::Bool(b),
            (ColumnType::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (ColumnType::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str()
            {
                "true" | "t" | "1" => Value::Bool(true),
                _ => Value::Bool(false),
            },
            (ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt, v) => {
                let i = match v {
                    Value::Int(i) => Some(i),
                    Value::Bool(b) => Some(b as i64),
                    Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
                    Value::Text(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                match i.and_then(|i| ty.fits(i).then_some(i)) {
                    Some(i) => Value::Int(i),
                    None => ty.zero(),
                }
            }
            (ColumnType::Real | ColumnType::Double, v) => match v {
                Value::Float(f) => Value::Float(f),
                Value::Int(i) => Value::Float(i as f64),
                Value::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .unwrap_or_else(|_| ty.zero()),
                Value::Bool(_) => ty.zero(),
            },
            (ColumnType::Varchar, Value::Text(s)) => Value::Text(s),
            (ColumnType::Varchar, v) => Value::Text(v.to_string()),
            _ => ty.zero(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// SQL column types a node may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// BOOLEAN
    Boolean,
    /// SMALLINT
    SmallInt,
    /// INTEGER
    Integer,
    /// BIGINT
    BigInt,
    /// REAL
    Real,
    /// DOUBLE PRECISION
    Double,
    /// VARCHAR / TEXT
    Varchar,
}

impl ColumnType {
    /// Parse a SQL type name. Returns `None` for unrecognized names.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Some(Self::Boolean),
            "smallint" | "int2" => Some(Self::SmallInt),
            "integer" | "int" | "int4" => Some(Self::Integer),
            "bigint" | "int8" => Some(Self::BigInt),
            "real" | "float4" => Some(Self::Real),
            "double" | "double precision" | "float8" => Some(Self::Double),
            "varchar" | "text" | "character varying" => Some(Self::Varchar),
            _ => None,
        }
    }

    /// The zero value of this type.
    pub fn zero(self) -> Value {
        match self {
            Self::Boolean => Value::Bool(false),
            Self::SmallInt | Self::Integer | Self::BigInt => Value::Int(0),
            Self::Real | Self::Double => Value::Float(0.0),
            Self::Varchar => Value::Text(String::new()),
        }
    }

    /// Column type as written in PostgreSQL DDL.
    pub fn postgres_type(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::SmallInt => "SMALLINT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Real => "REAL",
            Self::Double => "DOUBLE PRECISION",
            Self::Varchar => "VARCHAR",
        }
    }

    /// Column type as written in SQLite DDL.
    pub fn sqlite_type(self) -> &'static str {
        match self {
            Self::Boolean | Self::SmallInt | Self::Integer | Self::BigInt => "INTEGER",
            Self::Real | Self::Double => "REAL",
            Self::Varchar => "TEXT",
        }
    }

    fn fits(self, i: i64) -> bool {
        match self {
            Self::SmallInt => i16::try_from(i).is_ok(),
            Self::Integer => i32::try_from(i).is_ok(),
            _ => true,
        }
    }
}

/// A declared column of a node's relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Column type.
    pub ty: ColumnType,
}

impl ColumnSpec {
    /// Create a column spec.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A row read back from a relation together with its commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Commit time of the row.
    pub time: Timestamp,
    /// Column values, coerced to the declared types.
    pub values: Row,
}

/// Check a node id or column name before it reaches any SQL text.
pub fn validate_identifier(field: &str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SyncError::validation(
            field,
            format!(
                "'{}' must start with a letter or underscore and contain only letters, digits and underscores",
                ident
            ),
        ));
    }
    if ident.len() > MAX_IDENTIFIER_LEN {
        return Err(SyncError::validation(
            field,
            format!("'{}' exceeds {} characters", ident, MAX_IDENTIFIER_LEN),
        ));
    }
    Ok(())
}

/// Relation name backing a node id.
pub fn relation_name(node_id: &str) -> String {
    node_id.to_ascii_lowercase()
}
