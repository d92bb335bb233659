pub mod fields;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{BookRecord, Platform, RawRecord};
use crate::error::NormalizationError;

static ABSOLUTE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://[^\s/$.?#][^\s]*$").expect("valid url pattern"));

/// Output of the normalizer: the canonical record plus any anomalies that were
/// degraded to blank or default values. The caller decides where warnings go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFields {
    pub record: BookRecord,
    pub warnings: Vec<String>,
}

/// Trait for turning raw platform records into canonical book records
pub trait Normalizer: Send + Sync {
    /// Pure transformation, no I/O. Only a structurally unusable record is an error.
    fn normalize(&self, raw: &RawRecord, platform: Platform) -> Result<NormalizedFields, NormalizationError>;
}

/// Alias-driven normalizer shared by every supported platform
#[derive(Debug, Default, Clone)]
pub struct DefaultNormalizer;

impl DefaultNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Normalizer for DefaultNormalizer {
    fn normalize(&self, raw: &RawRecord, platform: Platform) -> Result<NormalizedFields, NormalizationError> {
        let data = raw.as_object().ok_or(NormalizationError::NotAnObject {
            found: value_kind(raw),
        })?;

        let mut warnings = Vec::new();
        let mut record = BookRecord::blank(platform);

        record.source_id = match fields::lookup(data, fields::ID) {
            Some(Value::String(s)) => clean_text(s),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                warnings.push(format!("id: unsupported {} value", value_kind(other)));
                String::new()
            }
            None => String::new(),
        };
        if record.source_id.is_empty() {
            warnings.push("id: missing".to_string());
        }

        record.title = text_field(data, fields::TITLE, &mut warnings).unwrap_or_default();
        if record.title.is_empty() {
            warnings.push("title: missing or blank".to_string());
        }

        record.authors = text_list_field(data, fields::AUTHORS, &mut warnings);
        record.publisher = text_field(data, fields::PUBLISHER, &mut warnings);
        record.book_type = text_field(data, fields::BOOK_TYPE, &mut warnings);
        record.tags = dedup(text_list_field(data, fields::TAGS, &mut warnings));

        record.isbn = fields::lookup(data, fields::ISBN).and_then(|v| match v {
            Value::String(s) => normalize_isbn(s),
            Value::Number(n) => normalize_isbn(&n.to_string()),
            other => {
                warnings.push(format!("isbn: unsupported {} value", value_kind(other)));
                None
            }
        });

        record.progress = fields::lookup(data, fields::PROGRESS).and_then(|v| {
            let parsed = coerce_number(v);
            if parsed.is_none() {
                warnings.push(format!("progress: '{}' is not numeric", display_value(v)));
            }
            parsed
        });

        record.is_finished = match fields::lookup(data, fields::IS_FINISHED) {
            None => false,
            Some(v) => coerce_bool(v).unwrap_or_else(|| {
                warnings.push(format!("isFinished: '{}' is not a boolean", display_value(v)));
                false
            }),
        };

        record.cover_url = fields::lookup(data, fields::COVER).and_then(|v| match v.as_str() {
            Some(s) if s.trim().is_empty() => None,
            Some(s) => {
                let resolved = normalize_cover_url(s, platform);
                if resolved.is_none() {
                    warnings.push(format!("cover: '{}' is not a resolvable URL", s.trim()));
                }
                resolved
            }
            None => {
                warnings.push(format!("cover: unsupported {} value", value_kind(v)));
                None
            }
        });

        record.last_read = fields::lookup(data, fields::LAST_READ).and_then(|v| {
            let parsed = parse_date(v);
            if parsed.is_none() {
                warnings.push(format!("lastRead: '{}' is not a date", display_value(v)));
            }
            parsed
        });
        record.last_updated = timestamp_field(data, fields::LAST_UPDATED, &mut warnings);
        record.retrieved_at = timestamp_field(data, fields::RETRIEVED_AT, &mut warnings);

        record.source_tab = fields::lookup(data, fields::SOURCE_TAB).and_then(|v| match v {
            Value::String(s) => Some(clean_text(s)).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        Ok(NormalizedFields { record, warnings })
    }
}

fn text_field(data: &Map<String, Value>, field: &str, warnings: &mut Vec<String>) -> Option<String> {
    match fields::lookup(data, field)? {
        Value::String(s) => Some(clean_text(s)).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        other => {
            warnings.push(format!("{}: unsupported {} value", field, value_kind(other)));
            None
        }
    }
}

fn text_list_field(data: &Map<String, Value>, field: &str, warnings: &mut Vec<String>) -> Vec<String> {
    match fields::lookup(data, field) {
        None => Vec::new(),
        Some(Value::String(s)) => {
            let cleaned = clean_text(s);
            if cleaned.is_empty() {
                Vec::new()
            } else {
                vec![cleaned]
            }
        }
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => {
                        let cleaned = clean_text(s);
                        if !cleaned.is_empty() {
                            out.push(cleaned);
                        }
                    }
                    Value::Null => {}
                    other => warnings.push(format!("{}: dropped {} entry", field, value_kind(other))),
                }
            }
            out
        }
        Some(other) => {
            warnings.push(format!("{}: unsupported {} value", field, value_kind(other)));
            Vec::new()
        }
    }
}

fn timestamp_field(
    data: &Map<String, Value>,
    field: &str,
    warnings: &mut Vec<String>,
) -> Option<DateTime<Utc>> {
    let value = fields::lookup(data, field)?;
    let parsed = parse_timestamp(value);
    if parsed.is_none() {
        warnings.push(format!("{}: '{}' is not a timestamp", field, display_value(value)));
    }
    parsed
}

/// Trim and collapse internal whitespace
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Numeric values and numeric-looking strings (`"75.5"`, `"75.5%"`). No clamping.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => {
            let trimmed = s.trim();
            let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
            trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        _ => None,
    }
}

pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Strip separators and upper-case the check digit. Shape is checked later.
pub fn normalize_isbn(s: &str) -> Option<String> {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Keep absolute http(s) URLs, resolve protocol- and root-relative ones, blank the rest
pub fn normalize_cover_url(s: &str, platform: Platform) -> Option<String> {
    let s = s.trim();
    let candidate = if let Some(rest) = s.strip_prefix("//") {
        format!("https://{}", rest)
    } else if s.starts_with('/') {
        format!("{}{}", platform.base_url(), s)
    } else {
        s.to_string()
    };
    if ABSOLUTE_URL.is_match(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Calendar date from RFC 3339, `YYYY-MM-DD`, `YYYY/MM/DD`, `MM/DD/YYYY` or epoch millis
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.date_naive()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc).date_naive());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(s, "%Y/%m/%d"))
                .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
                .ok()
                .or_else(|| parse_epoch_millis(s).map(|dt| dt.date_naive()))
        }
        _ => None,
    }
}

/// Instant from RFC 3339, epoch millis, or a bare date taken as midnight UTC
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            parse_epoch_millis(s)
                .or_else(|| parse_date(value).map(|d| d.and_time(NaiveTime::MIN).and_utc()))
        }
        _ => None,
    }
}

fn parse_epoch_millis(s: &str) -> Option<DateTime<Utc>> {
    if s.len() >= 10 && s.chars().all(|c| c.is_ascii_digit()) {
        s.parse::<i64>().ok().and_then(DateTime::<Utc>::from_timestamp_millis)
    } else {
        None
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
