use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Resume point of a source. Sequence numbers are assigned from `next_sequence`,
/// so re-fetching from the same cursor reproduces the same sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub pass: u64,
    pub position: u64,
    pub next_sequence: u64,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::start()
    }
}

impl Cursor {
    pub fn start() -> Self {
        Self {
            pass: 0,
            position: 0,
            next_sequence: 1,
        }
    }

    /// Cursor for the next full pass over the source, keeping the sequence counter.
    pub fn next_pass(self) -> Self {
        Self {
            pass: self.pass + 1,
            position: 0,
            next_sequence: self.next_sequence,
        }
    }

    /// Advance past `consumed` positions that produced `emitted` records.
    pub fn advance(self, consumed: u64, emitted: u64) -> Self {
        Self {
            pass: self.pass,
            position: self.position + consumed,
            next_sequence: self.next_sequence + emitted,
        }
    }
}

/// Payload exactly as retrieved from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawPayload {
    Bytes { content_type: String, body: Vec<u8> },
    Tree { value: JsonValue },
    /// The record slot exists upstream but its content could not be retrieved.
    Unavailable { reason: String },
}

impl RawPayload {
    pub fn html(body: impl Into<String>) -> Self {
        RawPayload::Bytes {
            content_type: "text/html".to_string(),
            body: body.into().into_bytes(),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            RawPayload::Bytes { body, .. } => body.clone(),
            RawPayload::Tree { value } => serde_json::to_vec(value).unwrap_or_default(),
            RawPayload::Unavailable { reason } => reason.as_bytes().to_vec(),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            RawPayload::Bytes { content_type, .. } if content_type.contains("html") => "html",
            RawPayload::Bytes { content_type, .. } if content_type.contains("json") => "json",
            RawPayload::Bytes { .. } => "bin",
            RawPayload::Tree { .. } => "json",
            RawPayload::Unavailable { .. } => "txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub fetch_sequence: u64,
    pub fetched_at: DateTime<Utc>,
    /// Where the payload came from (page URL, API endpoint, fixture path).
    pub locator: String,
    pub payload: RawPayload,
}

impl RawRecord {
    pub fn reference(&self) -> RawRef {
        RawRef {
            source_id: self.source_id.clone(),
            fetch_sequence: self.fetch_sequence,
            fetched_at: self.fetched_at,
            locator: self.locator.clone(),
        }
    }
}

/// Back-pointer from derived records to the raw record they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRef {
    pub source_id: String,
    pub fetch_sequence: u64,
    pub fetched_at: DateTime<Utc>,
    pub locator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Integer,
    Float,
    Timestamp,
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    List(Vec<String>),
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::Text(_) => ValueKind::Text,
            FieldValue::Integer(_) => ValueKind::Integer,
            FieldValue::Float(_) => ValueKind::Float,
            FieldValue::Timestamp(_) => ValueKind::Timestamp,
            FieldValue::List(_) => ValueKind::List,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// RFC 3339, or the naive UTC forms sources publish (`2026-10-18T12:30Z`,
    /// `2026-10-18 12:30:00`, a bare date at midnight).
    pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
        let text = text.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return Some(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%MZ", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .map(|naive| naive.and_utc())
    }

    /// Plain JSON rendering used by document payloads and reports.
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Text(v) => JsonValue::String(v.clone()),
            FieldValue::Integer(v) => JsonValue::from(*v),
            FieldValue::Float(v) => JsonValue::from(*v),
            FieldValue::Timestamp(v) => JsonValue::String(v.to_rfc3339()),
            FieldValue::List(v) => JsonValue::from(v.clone()),
        }
    }

    /// Ordering across comparable values; integers and floats compare numerically.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => Some(a.cmp(b)),
            (FieldValue::List(a), FieldValue::List(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            FieldValue::List(v) => write!(f, "{}", v.join(", ")),
        }
    }
}

/// How a field obtained its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum Provenance {
    Extracted { pointer: String },
    Inferred { from: String },
    Defaulted,
    Repaired { rule: String },
    Missing,
}

impl Provenance {
    pub fn is_present(&self) -> bool {
        matches!(self, Provenance::Extracted { .. })
    }
}

/// Typed fields pulled out of one raw record. Lives for a single pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateRecord {
    pub raw: RawRef,
    pub fields: BTreeMap<String, FieldValue>,
    pub provenance: BTreeMap<String, Provenance>,
}

impl IntermediateRecord {
    pub fn new(raw: RawRef) -> Self {
        Self {
            raw,
            fields: BTreeMap::new(),
            provenance: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_f64)
    }

    pub fn set(&mut self, field: &str, value: FieldValue, provenance: Provenance) {
        self.fields.insert(field.to_string(), value);
        self.provenance.insert(field.to_string(), provenance);
    }

    pub fn clear(&mut self, field: &str, provenance: Provenance) {
        self.fields.remove(field);
        self.provenance.insert(field.to_string(), provenance);
    }
}

/// A raw record whose payload could not be turned into an intermediate record.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("extract failure for {} #{}: {reason} (fields: {})", raw.locator, raw.fetch_sequence, fields.join(", "))]
pub struct ExtractFailure {
    pub raw: RawRef,
    pub fields: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Accepted,
    Repaired,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub field: String,
    pub rule: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    /// Empty for accepted records.
    pub violations: Vec<RuleViolation>,
}

impl ValidationOutcome {
    pub fn accepted() -> Self {
        Self {
            status: ValidationStatus::Accepted,
            violations: Vec::new(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.status == ValidationStatus::Rejected
    }
}
