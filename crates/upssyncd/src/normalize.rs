//! Normalization of apcupsd status records
//!
//! apcupsd reports every field as text with a trailing unit
//! (`124.0 Volts`, `5 Percent`) and dates in its own layout. This module
//! coerces the fields we know about into typed values. It is pure and
//! idempotent: feeding a normalized record back in returns it unchanged.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

/// Fields carrying a decimal measurement
pub const FLOAT_FIELDS: &[&str] = &[
    "LINEV", "LOADPCT", "BCHARGE", "TIMELEFT", "LOTRANS", "HITRANS", "BATTV", "NOMBATTV",
];

/// Fields carrying an integer count or limit
pub const INTEGER_FIELDS: &[&str] = &[
    "MBATTCHG", "MINTIMEL", "MAXTIME", "NUMXFERS", "TONBATT", "CUMONBATT", "NOMINV", "NOMPOWER",
];

/// Fields carrying a timestamp
pub const DATE_FIELDS: &[&str] = &["DATE", "STARTTIME", "XONBATT", "XOFFBATT", "LASTSTEST"];

static FLOAT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(\.\d+)").expect("valid regex"));
static INTEGER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

/// Output layout: `YYYY-MM-DDTHH:mm:ss±HH:mm`
const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Date layouts carrying their own offset
const OFFSET_DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%:z"];

/// Date layouts without offset, read as local wall-clock time
const LOCAL_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%a %b %d %H:%M:%S %Y",
];

/// Raw status record as decoded from the wire, in protocol order
pub type RawRecord = IndexMap<String, String>;

/// Normalized status record, in protocol order
pub type UpsRecord = IndexMap<String, UpsValue>;

/// A single normalized field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UpsValue {
    Float(f64),
    Integer(i64),
    /// ISO-8601 with explicit offset
    Timestamp(String),
    Text(String),
}

impl UpsValue {
    /// Text view for fields that stayed textual
    pub fn as_text(&self) -> Option<&str> {
        match self {
            UpsValue::Text(s) | UpsValue::Timestamp(s) => Some(s),
            _ => None,
        }
    }

    /// Value as stored in the state store
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            UpsValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            UpsValue::Integer(v) => serde_json::Value::from(*v),
            UpsValue::Timestamp(s) | UpsValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for UpsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsValue::Float(v) => write!(f, "{:?}", v),
            UpsValue::Integer(v) => write!(f, "{}", v),
            UpsValue::Timestamp(s) | UpsValue::Text(s) => f.write_str(s),
        }
    }
}

/// Normalize a raw wire record
pub fn normalize_ups_result(raw: &RawRecord) -> UpsRecord {
    let record = raw
        .iter()
        .map(|(k, v)| (k.clone(), UpsValue::Text(v.clone())))
        .collect();
    normalize_record(record)
}

/// Normalize an already typed record; applying twice equals applying once
pub fn normalize_record(record: UpsRecord) -> UpsRecord {
    let record = drop_empty(record);
    let record = normalize_dates(record);
    let record = normalize_floats(record);
    normalize_ints(record)
}

fn drop_empty(mut record: UpsRecord) -> UpsRecord {
    record.retain(|_, v| !matches!(v, UpsValue::Text(s) if s.trim().is_empty()));
    record
}

fn normalize_floats(mut record: UpsRecord) -> UpsRecord {
    for field in FLOAT_FIELDS {
        if let Some(value) = record.get_mut(*field) {
            if let Some(parsed) = value.as_text().and_then(parse_float) {
                *value = UpsValue::Float(parsed);
            }
        }
    }
    record
}

fn normalize_ints(mut record: UpsRecord) -> UpsRecord {
    for field in INTEGER_FIELDS {
        if let Some(value) = record.get_mut(*field) {
            if let Some(parsed) = value.as_text().and_then(parse_integer) {
                *value = UpsValue::Integer(parsed);
            }
        }
    }
    record
}

fn normalize_dates(mut record: UpsRecord) -> UpsRecord {
    for field in DATE_FIELDS {
        if let Some(value) = record.get_mut(*field) {
            if let Some(formatted) = value.as_text().and_then(to_iso_string) {
                *value = UpsValue::Timestamp(formatted);
            }
        }
    }
    record
}

/// First decimal token of `text`, e.g. `124.0 Volts` -> 124.0
pub fn parse_float(text: &str) -> Option<f64> {
    FLOAT_RE.find(text)?.as_str().parse().ok()
}

/// First integer token of `text`, e.g. `865 Watts` -> 865
pub fn parse_integer(text: &str) -> Option<i64> {
    INTEGER_RE.find(text)?.as_str().parse().ok()
}

/// Parse an apcupsd date and re-emit it in local time with explicit offset.
///
/// The offset is the local UTC offset at that instant, not the current one.
pub fn to_iso_string(text: &str) -> Option<String> {
    parse_date(text.trim()).map(|instant| {
        instant
            .with_timezone(&Local)
            .format(ISO_FORMAT)
            .to_string()
    })
}

fn parse_date(text: &str) -> Option<DateTime<FixedOffset>> {
    for format in OFFSET_DATE_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }

    for format in LOCAL_DATE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                return Some(local.fixed_offset());
            }
        }
    }

    None
}
