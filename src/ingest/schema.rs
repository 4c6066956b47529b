//! Declared column schema and the per-type coercion table.
//!
//! Column specs come from `[schema]` in config.toml and are compiled once at load
//! time into a [`CompiledSchema`]; the parser then only looks up function pointers.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Result, TabsyncError};

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Integer,
    Timestamp,
    Boolean,
}

/// A typed cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Number(f64),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl Value {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }
}

/// Column declaration as written in config.toml
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
    /// chrono strftime format for timestamp columns
    #[serde(default)]
    pub format: Option<String>,
}

fn default_required() -> bool {
    true
}

/// Coerces one raw cell. The second argument is the column's optional format.
pub type Coercer = fn(&str, Option<&str>) -> std::result::Result<Value, String>;

/// Coercion table: one entry per [`ColumnType`].
pub fn coercer_for(column_type: ColumnType) -> Coercer {
    match column_type {
        ColumnType::String => coerce_string,
        ColumnType::Number => coerce_number,
        ColumnType::Integer => coerce_integer,
        ColumnType::Timestamp => coerce_timestamp,
        ColumnType::Boolean => coerce_boolean,
    }
}

fn coerce_string(raw: &str, _format: Option<&str>) -> std::result::Result<Value, String> {
    Ok(Value::String(raw.to_string()))
}

fn coerce_number(raw: &str, _format: Option<&str>) -> std::result::Result<Value, String> {
    let n: f64 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a number", raw))?;
    if !n.is_finite() {
        return Err(format!("'{}' is not a finite number", raw));
    }
    Ok(Value::Number(n))
}

fn coerce_integer(raw: &str, _format: Option<&str>) -> std::result::Result<Value, String> {
    raw.parse::<i64>()
        .map(Value::Integer)
        .map_err(|_| format!("'{}' is not an integer", raw))
}

fn coerce_boolean(raw: &str, _format: Option<&str>) -> std::result::Result<Value, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Ok(Value::Boolean(true)),
        "false" | "no" | "n" | "0" => Ok(Value::Boolean(false)),
        _ => Err(format!("'{}' is not a boolean", raw)),
    }
}

const DEFAULT_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

fn coerce_timestamp(raw: &str, format: Option<&str>) -> std::result::Result<Value, String> {
    if let Some(fmt) = format {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Ok(Value::Timestamp(dt.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(Value::Timestamp(Utc.from_utc_datetime(&naive)));
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return midnight(date);
        }
        return Err(format!("'{}' does not match timestamp format '{}'", raw, fmt));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Value::Timestamp(dt.with_timezone(&Utc)));
    }
    for fmt in DEFAULT_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(Value::Timestamp(Utc.from_utc_datetime(&naive)));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return midnight(date);
    }
    Err(format!("'{}' is not a timestamp", raw))
}

fn midnight(date: NaiveDate) -> std::result::Result<Value, String> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Value::Timestamp(Utc.from_utc_datetime(&naive)))
        .ok_or_else(|| format!("invalid date {}", date))
}

/// Normalize a header cell into a canonical column name.
///
/// Lowercase, BOM and surrounding whitespace stripped, and runs of whitespace or
/// hyphens collapsed into a single underscore: `"Discount Percent"` → `discount_percent`.
pub fn canonical_name(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone)]
pub struct CompiledColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub required: bool,
    pub nullable: bool,
    pub format: Option<String>,
    pub coerce: Coercer,
}

impl CompiledColumn {
    /// Coerce a raw cell, mapping blanks to `Null` where the column allows it.
    pub fn coerce_cell(&self, raw: &str) -> std::result::Result<Value, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            if self.nullable {
                return Ok(Value::Null);
            }
            return Err("empty value in non-nullable column".to_string());
        }
        (self.coerce)(trimmed, self.format.as_deref())
    }
}

/// Schema ready for per-row use
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub table: String,
    pub columns: Vec<CompiledColumn>,
}

impl CompiledSchema {
    /// Validate column specs and resolve each to its coercer.
    pub fn compile(table: &str, specs: &[ColumnSpec]) -> Result<Self> {
        let table = table.trim();
        if table.is_empty() {
            return Err(TabsyncError::Config("schema.table must not be empty".to_string()));
        }
        if specs.is_empty() {
            return Err(TabsyncError::Config("schema.columns must declare at least one column".to_string()));
        }

        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = canonical_name(&spec.name);
            if name.is_empty() {
                return Err(TabsyncError::Config("schema column with empty name".to_string()));
            }
            if !seen.insert(name.clone()) {
                return Err(TabsyncError::Config(format!("duplicate schema column '{}'", name)));
            }
            if let Some(fmt) = &spec.format {
                if spec.column_type != ColumnType::Timestamp {
                    return Err(TabsyncError::Config(format!(
                        "column '{}': format is only valid for timestamp columns",
                        name
                    )));
                }
                if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
                    return Err(TabsyncError::Config(format!(
                        "column '{}': invalid timestamp format '{}'",
                        name, fmt
                    )));
                }
            }
            columns.push(CompiledColumn {
                name,
                column_type: spec.column_type,
                required: spec.required,
                // An optional column may be absent from the file entirely, so it must accept nulls
                nullable: spec.nullable || !spec.required,
                format: spec.format.clone(),
                coerce: coercer_for(spec.column_type),
            });
        }

        Ok(Self {
            table: table.to_string(),
            columns,
        })
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &CompiledColumn> {
        self.columns.iter().filter(|c| c.required)
    }
}
