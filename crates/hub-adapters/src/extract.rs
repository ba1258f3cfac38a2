//! Declarative field extraction.
//!
//! An [`ExtractionTable`] is plain data: for every field a locator (where the
//! value lives in the payload), a coercion (how the located text or JSON
//! becomes a [`FieldValue`]) and a default policy (what a missing value
//! means). New sources supply a new table, never new extraction code.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use hub_core::{
    ExtractFailure, FieldValue, IntermediateRecord, Provenance, RawPayload, RawRecord,
    SourceDomain,
};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    /// Text of the first element matching a CSS selector.
    Css { selector: String },
    CssAttr { selector: String, attr: String },
    /// Texts of every element matching the selector.
    CssAll { selector: String },
    /// Text of the first matching element whose text contains `contains` (case-insensitive).
    CssMatching { selector: String, contains: String },
    JsonPointer { pointer: String },
    /// Text of a field extracted earlier in the same table.
    Derived { from: String },
    /// The raw record's locator (page URL, endpoint).
    RecordLocator,
}

impl Locator {
    fn describe(&self) -> String {
        match self {
            Locator::Css { selector } | Locator::CssAll { selector } => selector.clone(),
            Locator::CssAttr { selector, attr } => format!("{selector}@{attr}"),
            Locator::CssMatching { selector, contains } => format!("{selector}:contains({contains})"),
            Locator::JsonPointer { pointer } => pointer.clone(),
            Locator::Derived { from } => from.clone(),
            Locator::RecordLocator => "locator".to_string(),
        }
    }

    fn needs_html(&self) -> bool {
        matches!(
            self,
            Locator::Css { .. }
                | Locator::CssAttr { .. }
                | Locator::CssAll { .. }
                | Locator::CssMatching { .. }
        )
    }

    fn needs_json(&self) -> bool {
        matches!(self, Locator::JsonPointer { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Coercion {
    Text,
    /// Digits only; anything after a decimal point is dropped ("£450,000.50" -> 450000).
    Integer,
    Float,
    /// ISO-8601 UTC, with or without seconds ("2026-10-18T12:00Z").
    Timestamp,
    TextList,
    /// Sum of `perc` over the listed fuels of a generation mix array, rounded to 2 decimals.
    RenewableShare { fuels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    Required,
    Optional,
    Default(FieldValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    pub locate: Locator,
    pub coerce: Coercion,
    pub default: DefaultPolicy,
    /// Regex applied to located text; the first capture group (or whole match) is kept.
    #[serde(default)]
    pub capture: Option<String>,
}

impl FieldRule {
    pub fn new(name: &str, locate: Locator, coerce: Coercion, default: DefaultPolicy) -> Self {
        Self {
            name: name.to_string(),
            locate,
            coerce,
            default,
            capture: None,
        }
    }

    pub fn capture(mut self, pattern: &str) -> Self {
        self.capture = Some(pattern.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTable {
    pub domain: SourceDomain,
    /// Fields are evaluated in order; `Derived` locators may only refer to earlier fields.
    pub fields: Vec<FieldRule>,
    #[serde(skip)]
    captures: CaptureCache,
}

/// Capture regexes keyed by pattern, compiled once on first extraction.
#[derive(Clone, Default)]
struct CaptureCache(OnceLock<HashMap<String, Result<Regex, String>>>);

impl CaptureCache {
    fn compiled<'a>(&'a self, fields: &[FieldRule]) -> &'a HashMap<String, Result<Regex, String>> {
        self.0.get_or_init(|| {
            fields
                .iter()
                .filter_map(|rule| rule.capture.as_deref())
                .map(|pattern| (pattern.to_string(), compile_capture(pattern)))
                .collect()
        })
    }
}

impl PartialEq for CaptureCache {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl fmt::Debug for CaptureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CaptureCache")
            .field(&self.0.get().map_or(0, HashMap::len))
            .finish()
    }
}

fn compile_capture(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid capture {pattern:?}: {e}"))
}

enum Located {
    Text(String),
    List(Vec<String>),
    Json(JsonValue),
}

enum Parsed {
    Html(Html),
    Json(JsonValue),
    Neither,
}

impl ExtractionTable {
    pub fn new(domain: SourceDomain, fields: Vec<FieldRule>) -> Self {
        Self {
            domain,
            fields,
            captures: CaptureCache::default(),
        }
    }

    /// Replace the CSS selector of named fields; unknown names are ignored.
    pub fn with_selector_overrides(mut self, overrides: &BTreeMap<String, String>) -> Self {
        for rule in &mut self.fields {
            let Some(selector) = overrides.get(&rule.name) else {
                continue;
            };
            match &mut rule.locate {
                Locator::Css { selector: s }
                | Locator::CssAll { selector: s }
                | Locator::CssAttr { selector: s, .. }
                | Locator::CssMatching { selector: s, .. } => *s = selector.clone(),
                _ => {}
            }
        }
        self
    }

    fn capture(&self, pattern: &str, found: Located) -> Result<Option<Located>, String> {
        match self.captures.compiled(&self.fields).get(pattern) {
            Some(Ok(re)) => Ok(apply_capture(re, found)),
            Some(Err(reason)) => Err(reason.clone()),
            // Rule edited after the first extraction.
            None => Ok(apply_capture(&compile_capture(pattern)?, found)),
        }
    }

    pub fn required_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|r| r.default == DefaultPolicy::Required)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Pure function of the raw record: no IO, no shared state.
    pub fn extract(&self, raw: &RawRecord) -> Result<IntermediateRecord, ExtractFailure> {
        let failure = |fields: Vec<String>, reason: String| ExtractFailure {
            raw: raw.reference(),
            fields,
            reason,
        };

        let parsed = self
            .parse_payload(&raw.payload)
            .map_err(|reason| failure(self.required_fields(), reason))?;

        let mut record = IntermediateRecord::new(raw.reference());
        let mut failed = Vec::new();
        let mut reasons = Vec::new();

        for rule in &self.fields {
            let located = locate(&rule.locate, &parsed, raw, &record)
                .map_err(|reason| failure(vec![rule.name.clone()], reason))?;
            let located = match (&rule.capture, located) {
                (Some(pattern), Some(found)) => self
                    .capture(pattern, found)
                    .map_err(|reason| failure(vec![rule.name.clone()], reason))?,
                (_, found) => found,
            };

            let value = match located {
                Some(found) => match coerce(&rule.coerce, found) {
                    Ok(v) => v,
                    Err(reason) => {
                        debug!(field = %rule.name, %reason, "field failed coercion");
                        reasons.push(format!("{}: {reason}", rule.name));
                        None
                    }
                },
                None => None,
            };

            match (value, &rule.default) {
                (Some(value), _) => {
                    let provenance = match &rule.locate {
                        Locator::Derived { from } => Provenance::Inferred { from: from.clone() },
                        other => Provenance::Extracted {
                            pointer: other.describe(),
                        },
                    };
                    record.set(&rule.name, value, provenance);
                }
                (None, DefaultPolicy::Required) => {
                    failed.push(rule.name.clone());
                    record.clear(&rule.name, Provenance::Missing);
                }
                (None, DefaultPolicy::Optional) => record.clear(&rule.name, Provenance::Missing),
                (None, DefaultPolicy::Default(default)) => {
                    record.set(&rule.name, default.clone(), Provenance::Defaulted)
                }
            }
        }

        if failed.is_empty() {
            Ok(record)
        } else {
            let reason = if reasons.is_empty() {
                "required fields missing".to_string()
            } else {
                reasons.join("; ")
            };
            Err(failure(failed, reason))
        }
    }

    fn parse_payload(&self, payload: &RawPayload) -> Result<Parsed, String> {
        let wants_html = self.fields.iter().any(|r| r.locate.needs_html());
        let wants_json = self.fields.iter().any(|r| r.locate.needs_json());
        match payload {
            RawPayload::Unavailable { reason } => Err(format!("payload unavailable: {reason}")),
            RawPayload::Tree { value } => Ok(Parsed::Json(value.clone())),
            RawPayload::Bytes { body, content_type } => {
                if wants_json && (content_type.contains("json") || !wants_html) {
                    serde_json::from_slice(body)
                        .map(Parsed::Json)
                        .map_err(|e| format!("invalid JSON payload: {e}"))
                } else if wants_html {
                    let text = std::str::from_utf8(body)
                        .map_err(|e| format!("payload is not UTF-8: {e}"))?;
                    Ok(Parsed::Html(Html::parse_document(text)))
                } else {
                    Ok(Parsed::Neither)
                }
            }
        }
    }
}

fn collapse_whitespace(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {css:?}: {e}"))
}

fn locate(
    locator: &Locator,
    parsed: &Parsed,
    raw: &RawRecord,
    so_far: &IntermediateRecord,
) -> Result<Option<Located>, String> {
    let html = || match parsed {
        Parsed::Html(doc) => Ok(doc),
        _ => Err("payload is not HTML".to_string()),
    };
    Ok(match locator {
        Locator::Css { selector: css } => html()?
            .select(&selector(css)?)
            .find_map(|n| collapse_whitespace(&n.text().collect::<String>()))
            .map(Located::Text),
        Locator::CssAttr { selector: css, attr } => html()?
            .select(&selector(css)?)
            .find_map(|n| n.value().attr(attr).and_then(collapse_whitespace))
            .map(Located::Text),
        Locator::CssAll { selector: css } => {
            let items: Vec<String> = html()?
                .select(&selector(css)?)
                .filter_map(|n| collapse_whitespace(&n.text().collect::<String>()))
                .collect();
            (!items.is_empty()).then_some(Located::List(items))
        }
        Locator::CssMatching {
            selector: css,
            contains,
        } => {
            let needle = contains.to_ascii_lowercase();
            html()?
                .select(&selector(css)?)
                .filter_map(|n| collapse_whitespace(&n.text().collect::<String>()))
                .find(|t| t.to_ascii_lowercase().contains(&needle))
                .map(Located::Text)
        }
        Locator::JsonPointer { pointer } => match parsed {
            Parsed::Json(value) => value
                .pointer(pointer)
                .filter(|v| !v.is_null())
                .cloned()
                .map(Located::Json),
            _ => return Err("payload is not JSON".to_string()),
        },
        Locator::Derived { from } => so_far
            .get(from)
            .map(|v| Located::Text(v.to_string())),
        Locator::RecordLocator => Some(Located::Text(raw.locator.clone())),
    })
}

fn apply_capture(re: &Regex, found: Located) -> Option<Located> {
    let text = match found {
        Located::Text(t) => t,
        Located::List(items) => items.join(" "),
        Located::Json(JsonValue::String(s)) => s,
        Located::Json(other) => other.to_string(),
    };
    re.captures(&text).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| Located::Text(m.as_str().to_string()))
    })
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    FieldValue::parse_timestamp(text)
}

/// First run of digits (with thousands separators), so ranges keep their lower bound.
fn integer_from_text(text: &str) -> Option<i64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(char::is_ascii_digit)
        .collect();
    let value = digits.parse::<i64>().ok()?;
    let negative = text[..start].trim_start().starts_with('-');
    Some(if negative { -value } else { value })
}

fn float_from_text(text: &str) -> Option<f64> {
    let first_digit = text.find(|c: char| c.is_ascii_digit())?;
    let start = match text[..first_digit].strip_suffix('.') {
        Some(prefix) => prefix.len(),
        None => first_digit,
    };
    let number: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| *c != ',')
        .collect();
    let value = number.trim_end_matches('.').parse::<f64>().ok()?;
    let negative = text[..start].trim_start().starts_with('-');
    Some(if negative { -value } else { value })
}

fn coerce(coercion: &Coercion, found: Located) -> Result<Option<FieldValue>, String> {
    let as_text = |found: &Located| -> Option<String> {
        match found {
            Located::Text(t) => Some(t.clone()),
            Located::List(items) => items.first().cloned(),
            Located::Json(JsonValue::String(s)) => collapse_whitespace(s),
            Located::Json(JsonValue::Number(n)) => Some(n.to_string()),
            Located::Json(_) => None,
        }
    };

    Ok(match coercion {
        Coercion::Text => as_text(&found).map(FieldValue::Text),
        Coercion::Integer => match &found {
            Located::Json(JsonValue::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(FieldValue::Integer),
            other => {
                let text = as_text(other).ok_or("expected a number")?;
                Some(FieldValue::Integer(
                    integer_from_text(&text).ok_or_else(|| format!("no digits in {text:?}"))?,
                ))
            }
        },
        Coercion::Float => match &found {
            Located::Json(JsonValue::Number(n)) => n.as_f64().map(FieldValue::Float),
            other => {
                let text = as_text(other).ok_or("expected a number")?;
                Some(FieldValue::Float(
                    float_from_text(&text).ok_or_else(|| format!("not a number: {text:?}"))?,
                ))
            }
        },
        Coercion::Timestamp => {
            let text = as_text(&found).ok_or("expected a timestamp string")?;
            Some(FieldValue::Timestamp(
                parse_timestamp(&text).ok_or_else(|| format!("unparseable timestamp {text:?}"))?,
            ))
        }
        Coercion::TextList => match found {
            Located::List(items) => Some(FieldValue::List(items)),
            Located::Text(t) => Some(FieldValue::List(vec![t])),
            Located::Json(JsonValue::Array(items)) => Some(FieldValue::List(
                items
                    .iter()
                    .filter_map(|v| v.as_str().and_then(collapse_whitespace))
                    .collect(),
            )),
            Located::Json(_) => return Err("expected a list".to_string()),
        },
        Coercion::RenewableShare { fuels } => {
            let Located::Json(JsonValue::Array(mix)) = found else {
                return Err("expected a generation mix array".to_string());
            };
            let total: f64 = mix
                .iter()
                .filter(|entry| {
                    entry
                        .get("fuel")
                        .and_then(JsonValue::as_str)
                        .is_some_and(|fuel| fuels.iter().any(|f| f.eq_ignore_ascii_case(fuel)))
                })
                .filter_map(|entry| entry.get("perc").and_then(JsonValue::as_f64))
                .sum();
            Some(FieldValue::Float((total * 100.0).round() / 100.0))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(payload: RawPayload) -> RawRecord {
        RawRecord {
            source_id: "test".into(),
            fetch_sequence: 1,
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).single().unwrap(),
            locator: "https://example.test/details/1".into(),
            payload,
        }
    }

    fn table(fields: Vec<FieldRule>) -> ExtractionTable {
        ExtractionTable::new(SourceDomain::PropertyListing, fields)
    }

    #[test]
    fn integer_coercion_keeps_digits_and_drops_pence() {
        assert_eq!(integer_from_text("£450,000"), Some(450_000));
        assert_eq!(integer_from_text("£1,250.75 pcm"), Some(1_250));
        assert_eq!(integer_from_text("3 bedrooms"), Some(3));
        assert_eq!(integer_from_text("-1"), Some(-1));
        assert_eq!(integer_from_text("POA"), None);
        assert_eq!(integer_from_text("£450,000 - £500,000"), Some(450_000));
        assert_eq!(integer_from_text("Guide price £1,100,000 to £1,250,000"), Some(1_100_000));
        assert_eq!(float_from_text("42.3% - 45%"), Some(42.3));
        assert_eq!(float_from_text("-0.5"), Some(-0.5));
    }

    #[test]
    fn capture_patterns_compile_once_per_table() {
        let t = table(vec![FieldRule::new(
            "postcode",
            Locator::Css { selector: "address".into() },
            Coercion::Text,
            DefaultPolicy::Optional,
        )
        .capture(r"([A-Z]{1,2}[0-9][A-Z0-9]? ?[0-9][A-Z]{2})")]);
        assert!(t.captures.0.get().is_none());

        for address in ["1 Old St, London EC1V 9HL", "2 Mare St, London E8 4RP"] {
            let html = format!("<address>{address}</address>");
            t.extract(&raw(RawPayload::html(&html))).unwrap();
        }
        assert_eq!(t.captures.0.get().map(HashMap::len), Some(1));

        let broken = table(vec![FieldRule::new(
            "postcode",
            Locator::Css { selector: "address".into() },
            Coercion::Text,
            DefaultPolicy::Optional,
        )
        .capture("([A-Z")]);
        let payload = RawPayload::html("<address>1 Old St</address>");
        for _ in 0..2 {
            let err = broken.extract(&raw(payload.clone())).unwrap_err();
            assert!(err.reason.contains("invalid capture"));
        }
    }

    #[test]
    fn timestamps_accept_minute_precision_zulu() {
        let ts = parse_timestamp("2026-10-18T12:30Z").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 10, 18, 12, 30, 0).single().unwrap());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn html_fields_record_provenance_and_inference() {
        let t = table(vec![
            FieldRule::new(
                "address",
                Locator::Css { selector: "address".into() },
                Coercion::Text,
                DefaultPolicy::Required,
            ),
            FieldRule::new(
                "postcode",
                Locator::Derived { from: "address".into() },
                Coercion::Text,
                DefaultPolicy::Optional,
            )
            .capture(r"([A-Z]{1,2}[0-9][A-Z0-9]? ?[0-9][A-Z]{2})"),
            FieldRule::new(
                "furnished",
                Locator::Css { selector: ".furnished".into() },
                Coercion::Text,
                DefaultPolicy::Default(FieldValue::Text("unknown".into())),
            ),
            FieldRule::new("listing_url", Locator::RecordLocator, Coercion::Text, DefaultPolicy::Optional),
        ]);
        let record = t
            .extract(&raw(RawPayload::html(
                "<html><body><address>  12 Brick Lane,\n London E1 6RF </address></body></html>",
            )))
            .unwrap();

        assert_eq!(record.text("address"), Some("12 Brick Lane, London E1 6RF"));
        assert_eq!(record.text("postcode"), Some("E1 6RF"));
        assert_eq!(
            record.provenance.get("postcode"),
            Some(&Provenance::Inferred { from: "address".into() })
        );
        assert_eq!(record.provenance.get("furnished"), Some(&Provenance::Defaulted));
        assert_eq!(record.text("listing_url"), Some("https://example.test/details/1"));
    }

    #[test]
    fn missing_required_field_lists_offenders() {
        let t = table(vec![FieldRule::new(
            "address",
            Locator::Css { selector: "address".into() },
            Coercion::Text,
            DefaultPolicy::Required,
        )]);
        let err = t.extract(&raw(RawPayload::html("<div>layout changed</div>"))).unwrap_err();
        assert_eq!(err.fields, vec!["address".to_string()]);
    }

    #[test]
    fn unavailable_payload_fails_with_required_fields() {
        let t = table(vec![FieldRule::new(
            "address",
            Locator::Css { selector: "address".into() },
            Coercion::Text,
            DefaultPolicy::Required,
        )]);
        let err = t
            .extract(&raw(RawPayload::Unavailable { reason: "HTTP 500".into() }))
            .unwrap_err();
        assert!(err.reason.contains("HTTP 500"));
        assert_eq!(err.fields, vec!["address".to_string()]);
    }

    #[test]
    fn renewable_share_sums_selected_fuels() {
        let t = ExtractionTable::new(
            SourceDomain::CarbonIntensity,
            vec![FieldRule::new(
                "renewable_percentage",
                Locator::JsonPointer { pointer: "/generationmix".into() },
                Coercion::RenewableShare {
                    fuels: vec!["wind".into(), "solar".into()],
                },
                DefaultPolicy::Optional,
            )],
        );
        let record = t
            .extract(&raw(RawPayload::Tree {
                value: json!({"generationmix": [
                    {"fuel": "wind", "perc": 30.333},
                    {"fuel": "solar", "perc": 1.2},
                    {"fuel": "gas", "perc": 50.0}
                ]}),
            }))
            .unwrap();
        assert_eq!(record.number("renewable_percentage"), Some(31.53));
    }

    #[test]
    fn selector_overrides_replace_only_named_fields() {
        let t = table(vec![FieldRule::new(
            "price",
            Locator::Css { selector: ".price".into() },
            Coercion::Integer,
            DefaultPolicy::Optional,
        )])
        .with_selector_overrides(&BTreeMap::from([
            ("price".to_string(), "p.asking-price".to_string()),
            ("nope".to_string(), "x".to_string()),
        ]));
        assert_eq!(
            t.fields[0].locate,
            Locator::Css { selector: "p.asking-price".into() }
        );
    }
}
