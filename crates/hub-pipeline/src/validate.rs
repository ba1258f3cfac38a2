use std::cmp::Ordering;

use anyhow::{Context, Result};
use hub_core::{
    FieldValue, IntermediateRecord, Provenance, RuleViolation, ValidationOutcome,
    ValidationStatus,
};
use regex::Regex;

use crate::schema::{Check, Repair, Rule, RuleSet, Severity};

enum Verdict {
    Pass,
    Violated(String),
}

struct CompiledRule {
    rule: Rule,
    pattern: Option<Regex>,
}

/// Evaluates a rule set against intermediate records. Each rule passes or
/// is violated; a violated repairable rule applies its repair in place and
/// the record's outcome is the worst severity seen.
pub struct Validator {
    rules: Vec<CompiledRule>,
}

impl Validator {
    pub fn new(set: &RuleSet) -> Result<Self> {
        set.check_consistency()?;
        let rules = set
            .rules
            .iter()
            .map(|rule| {
                let pattern = match &rule.check {
                    Check::Pattern { regex } => Some(
                        Regex::new(&format!("^(?:{regex})$"))
                            .with_context(|| format!("compiling pattern of rule {}", rule.name))?,
                    ),
                    _ => None,
                };
                Ok(CompiledRule {
                    rule: rule.clone(),
                    pattern,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn validate(&self, record: &mut IntermediateRecord) -> ValidationOutcome {
        let mut status = ValidationStatus::Accepted;
        let mut violations = Vec::new();

        for compiled in &self.rules {
            let rule = &compiled.rule;
            let Verdict::Violated(detail) = evaluate(compiled, record) else {
                continue;
            };
            violations.push(RuleViolation {
                field: rule.field.clone(),
                rule: rule.name.clone(),
                detail,
            });
            match (rule.severity, &rule.repair) {
                (Severity::Fatal, _) => status = ValidationStatus::Rejected,
                (Severity::Repairable, Some(repair)) => {
                    apply_repair(rule, repair, record);
                    status = status.max(ValidationStatus::Repaired);
                }
                (Severity::Repairable, None) => status = ValidationStatus::Rejected,
            }
        }

        ValidationOutcome { status, violations }
    }
}

fn evaluate(compiled: &CompiledRule, record: &IntermediateRecord) -> Verdict {
    let rule = &compiled.rule;
    let value = record.get(&rule.field);

    match &rule.check {
        Check::Required => match value {
            None => Verdict::Violated("missing".to_string()),
            Some(FieldValue::Text(t)) if t.trim().is_empty() => {
                Verdict::Violated("empty".to_string())
            }
            Some(_) => Verdict::Pass,
        },
        Check::Range {
            min,
            max,
            min_inclusive,
            max_inclusive,
        } => {
            let Some(value) = value else {
                return Verdict::Pass;
            };
            let Some(n) = value.as_f64() else {
                return Verdict::Violated(format!("{value} is not numeric"));
            };
            if let Some(min) = min {
                let below = if *min_inclusive { n < *min } else { n <= *min };
                if below {
                    return Verdict::Violated(format!(
                        "{n} below {}{min}",
                        if *min_inclusive { "" } else { "or equal to " }
                    ));
                }
            }
            if let Some(max) = max {
                let above = if *max_inclusive { n > *max } else { n >= *max };
                if above {
                    return Verdict::Violated(format!(
                        "{n} above {}{max}",
                        if *max_inclusive { "" } else { "or equal to " }
                    ));
                }
            }
            Verdict::Pass
        }
        Check::OneOf { values } => match value {
            None => Verdict::Pass,
            Some(v) => {
                let rendered = v.to_string();
                if values.iter().any(|allowed| allowed.eq_ignore_ascii_case(&rendered)) {
                    Verdict::Pass
                } else {
                    Verdict::Violated(format!("{rendered:?} not one of {}", values.join(", ")))
                }
            }
        },
        Check::Pattern { regex } => match value {
            None => Verdict::Pass,
            Some(v) => {
                let rendered = v.to_string();
                let matched = compiled
                    .pattern
                    .as_ref()
                    .is_some_and(|re| re.is_match(&rendered));
                if matched {
                    Verdict::Pass
                } else {
                    Verdict::Violated(format!("{rendered:?} does not match {regex}"))
                }
            }
        },
        Check::After { field } => {
            let (Some(value), Some(other)) = (value, record.get(field)) else {
                return Verdict::Pass;
            };
            match value.compare(other) {
                Some(Ordering::Greater) => Verdict::Pass,
                Some(_) => Verdict::Violated(format!("{value} not after {field} {other}")),
                None => Verdict::Violated(format!("{value} not comparable with {field}")),
            }
        }
    }
}

fn apply_repair(rule: &Rule, repair: &Repair, record: &mut IntermediateRecord) {
    let provenance = Provenance::Repaired {
        rule: rule.name.clone(),
    };
    match repair {
        Repair::Clamp => {
            let Check::Range { min, max, .. } = &rule.check else {
                return;
            };
            let Some(current) = record.get(&rule.field).cloned() else {
                return;
            };
            match clamp(&current, *min, *max) {
                Some(clamped) => record.set(&rule.field, clamped, provenance),
                None => record.clear(&rule.field, provenance),
            }
        }
        Repair::Default { value } => record.set(&rule.field, value.clone(), provenance),
        Repair::Drop => record.clear(&rule.field, provenance),
        Repair::Bands {
            from,
            bands,
            otherwise,
        } => match record.number(from) {
            Some(n) => {
                let value = bands
                    .iter()
                    .find(|b| n < b.below)
                    .map(|b| b.value.clone())
                    .unwrap_or_else(|| otherwise.clone());
                record.set(&rule.field, FieldValue::Text(value), provenance);
            }
            None => record.clear(&rule.field, provenance),
        },
    }
}

/// Clamp a numeric value into the bounds, keeping its kind. Non-numeric values
/// cannot be clamped and yield `None`.
fn clamp(value: &FieldValue, min: Option<f64>, max: Option<f64>) -> Option<FieldValue> {
    let bound = |n: f64| {
        let n = min.map_or(n, |m| n.max(m));
        max.map_or(n, |m| n.min(m))
    };
    match value {
        FieldValue::Integer(v) => Some(FieldValue::Integer(bound(*v as f64).round() as i64)),
        FieldValue::Float(v) => Some(FieldValue::Float(bound(*v))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hub_core::{RawRef, SourceDomain};

    fn record(fields: &[(&str, FieldValue)]) -> IntermediateRecord {
        let mut record = IntermediateRecord::new(RawRef {
            source_id: "test".into(),
            fetch_sequence: 1,
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().unwrap(),
            locator: "fixture://test/1".into(),
        });
        for (name, value) in fields {
            record.set(
                name,
                value.clone(),
                Provenance::Extracted {
                    pointer: name.to_string(),
                },
            );
        }
        record
    }

    fn carbon(forecast: i64) -> IntermediateRecord {
        let from = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().unwrap();
        record(&[
            ("region_id", FieldValue::Integer(13)),
            ("from", FieldValue::Timestamp(from)),
            ("to", FieldValue::Timestamp(from + chrono::Duration::minutes(30))),
            ("intensity_forecast", FieldValue::Integer(forecast)),
            ("intensity_index", FieldValue::Text("low".into())),
        ])
    }

    fn validator(domain: SourceDomain) -> Validator {
        Validator::new(&RuleSet::builtin(domain)).unwrap()
    }

    #[test]
    fn carbon_forecast_boundaries_are_inclusive() {
        let v = validator(SourceDomain::CarbonIntensity);
        assert_eq!(v.validate(&mut carbon(0)).status, ValidationStatus::Accepted);
        assert_eq!(v.validate(&mut carbon(1500)).status, ValidationStatus::Accepted);

        let rejected = v.validate(&mut carbon(-1));
        assert_eq!(rejected.status, ValidationStatus::Rejected);
        assert_eq!(rejected.violations[0].rule, "forecast_physical_range");
        assert_eq!(v.validate(&mut carbon(1501)).status, ValidationStatus::Rejected);
    }

    #[test]
    fn unknown_index_is_rederived_from_forecast_bands() {
        let v = validator(SourceDomain::CarbonIntensity);
        for (forecast, expected) in [(99, "very low"), (100, "low"), (249, "moderate"), (299, "high"), (300, "very high")] {
            let mut r = carbon(forecast);
            r.set("intensity_index", FieldValue::Text("sky high".into()), Provenance::Defaulted);
            let outcome = v.validate(&mut r);
            assert_eq!(outcome.status, ValidationStatus::Repaired);
            assert_eq!(r.text("intensity_index"), Some(expected), "forecast {forecast}");
            assert_eq!(
                r.provenance.get("intensity_index"),
                Some(&Provenance::Repaired {
                    rule: "index_known".into()
                })
            );
        }
    }

    #[test]
    fn index_match_is_case_insensitive() {
        let v = validator(SourceDomain::CarbonIntensity);
        let mut r = carbon(120);
        r.set("intensity_index", FieldValue::Text("Very Low".into()), Provenance::Defaulted);
        assert_eq!(v.validate(&mut r).status, ValidationStatus::Accepted);
    }

    #[test]
    fn renewable_share_is_clamped_keeping_float_kind() {
        let v = validator(SourceDomain::CarbonIntensity);
        let mut r = carbon(120);
        r.set("renewable_percentage", FieldValue::Float(104.2), Provenance::Defaulted);
        assert_eq!(v.validate(&mut r).status, ValidationStatus::Repaired);
        assert_eq!(r.get("renewable_percentage"), Some(&FieldValue::Float(100.0)));
    }

    #[test]
    fn period_must_end_after_it_starts() {
        let v = validator(SourceDomain::CarbonIntensity);
        let mut r = carbon(120);
        let from = r.get("from").cloned().unwrap();
        r.set("to", from, Provenance::Defaulted);
        let outcome = v.validate(&mut r);
        assert_eq!(outcome.status, ValidationStatus::Rejected);
        assert_eq!(outcome.violations[0].field, "to");
    }

    #[test]
    fn price_zero_is_rejected_and_missing_price_too() {
        let v = validator(SourceDomain::PropertyListing);
        let mut zero = record(&[
            ("address", FieldValue::Text("1 High St, London E1 6AN".into())),
            ("price", FieldValue::Integer(0)),
        ]);
        assert_eq!(v.validate(&mut zero).status, ValidationStatus::Rejected);

        let mut missing = record(&[("address", FieldValue::Text("1 High St".into()))]);
        let outcome = v.validate(&mut missing);
        assert_eq!(outcome.status, ValidationStatus::Rejected);
        assert_eq!(outcome.violations[0].rule, "price_required");
    }

    #[test]
    fn repairs_and_fatal_mix_to_rejected() {
        let v = validator(SourceDomain::PropertyListing);
        let mut r = record(&[
            ("address", FieldValue::Text("   ".into())),
            ("price", FieldValue::Integer(500_000)),
            ("bedrooms", FieldValue::Integer(64)),
        ]);
        let outcome = v.validate(&mut r);
        assert_eq!(outcome.status, ValidationStatus::Rejected);
        assert_eq!(outcome.violations.len(), 2);
    }

    #[test]
    fn property_repairs_clamp_rooms_and_drop_bad_grades() {
        let v = validator(SourceDomain::PropertyListing);
        let mut r = record(&[
            ("address", FieldValue::Text("9 Mare St, London E8 4RP".into())),
            ("price", FieldValue::Integer(725_000)),
            ("bedrooms", FieldValue::Integer(64)),
            ("bathrooms", FieldValue::Integer(2)),
            ("epc_rating", FieldValue::Text("H".into())),
            ("postcode", FieldValue::Text("E8 4RP".into())),
        ]);
        let outcome = v.validate(&mut r);
        assert_eq!(outcome.status, ValidationStatus::Repaired);
        assert_eq!(r.get("bedrooms"), Some(&FieldValue::Integer(50)));
        assert!(r.get("epc_rating").is_none());
        assert_eq!(r.text("postcode"), Some("E8 4RP"));
        let rules: Vec<_> = outcome.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(rules, vec!["bedrooms_range", "epc_rating_grade"]);
    }

    #[test]
    fn malformed_postcode_is_dropped() {
        let v = validator(SourceDomain::PropertyListing);
        let mut r = record(&[
            ("address", FieldValue::Text("Somewhere".into())),
            ("price", FieldValue::Integer(1)),
            ("postcode", FieldValue::Text("NOT A CODE".into())),
        ]);
        assert_eq!(v.validate(&mut r).status, ValidationStatus::Repaired);
        assert!(r.get("postcode").is_none());
    }
}
