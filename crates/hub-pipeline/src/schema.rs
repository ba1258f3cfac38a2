//! Per-domain data: validation rule sets (loadable from YAML) and the
//! identity/column layout the merger and sinks work from.

use std::path::Path;

use anyhow::{bail, Context, Result};
use hub_core::{ColumnSpec, FieldValue, SourceDomain, ValueKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Repairable,
    Fatal,
}

fn inclusive() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    Required,
    /// Bounds are inclusive unless stated otherwise.
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default = "inclusive")]
        min_inclusive: bool,
        #[serde(default = "inclusive")]
        max_inclusive: bool,
    },
    /// Case-insensitive membership.
    OneOf { values: Vec<String> },
    /// Whole-value regex match.
    Pattern { regex: String },
    /// Timestamp strictly later than another field's.
    After { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub below: f64,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Repair {
    Clamp,
    Default { value: FieldValue },
    Drop,
    /// Re-derive the value from a numeric field: first band whose `below` exceeds it.
    Bands {
        from: String,
        bands: Vec<Band>,
        otherwise: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub field: String,
    pub check: Check,
    pub severity: Severity,
    #[serde(default)]
    pub repair: Option<Repair>,
}

impl Rule {
    fn fatal(name: &str, field: &str, check: Check) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            check,
            severity: Severity::Fatal,
            repair: None,
        }
    }

    fn repairable(name: &str, field: &str, check: Check, repair: Repair) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            check,
            severity: Severity::Repairable,
            repair: Some(repair),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: u32,
    pub domain: SourceDomain,
    pub rules: Vec<Rule>,
}

fn range(min: Option<f64>, max: Option<f64>) -> Check {
    Check::Range {
        min,
        max,
        min_inclusive: true,
        max_inclusive: true,
    }
}

pub const INTENSITY_INDEXES: [&str; 5] = ["very low", "low", "moderate", "high", "very high"];

/// Upper bound on plausible grid carbon intensity, gCO2/kWh.
pub const CARBON_INTENSITY_MAX: f64 = 1500.0;

impl RuleSet {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let set: RuleSet =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        set.check_consistency()
            .with_context(|| format!("checking {}", path.display()))?;
        Ok(set)
    }

    pub fn check_consistency(&self) -> Result<()> {
        for rule in &self.rules {
            match (&rule.severity, &rule.repair) {
                (Severity::Repairable, None) => {
                    bail!("rule {} is repairable but declares no repair", rule.name)
                }
                (Severity::Fatal, Some(_)) => {
                    bail!("rule {} is fatal and cannot declare a repair", rule.name)
                }
                _ => {}
            }
            if let (Some(Repair::Clamp), check) = (&rule.repair, &rule.check) {
                match check {
                    Check::Range {
                        min_inclusive: true,
                        max_inclusive: true,
                        ..
                    } => {}
                    _ => bail!("rule {}: clamp needs an inclusive range check", rule.name),
                }
            }
        }
        Ok(())
    }

    pub fn builtin(domain: SourceDomain) -> Self {
        match domain {
            SourceDomain::PropertyListing => Self::property_listing(),
            SourceDomain::CarbonIntensity => Self::carbon_intensity(),
        }
    }

    fn property_listing() -> Self {
        let rooms = |field: &str| {
            Rule::repairable(
                &format!("{field}_range"),
                field,
                range(Some(0.0), Some(50.0)),
                Repair::Clamp,
            )
        };
        Self {
            version: 1,
            domain: SourceDomain::PropertyListing,
            rules: vec![
                Rule::fatal("address_required", "address", Check::Required),
                Rule::fatal("price_required", "price", Check::Required),
                Rule::fatal(
                    "price_positive",
                    "price",
                    Check::Range {
                        min: Some(0.0),
                        max: None,
                        min_inclusive: false,
                        max_inclusive: true,
                    },
                ),
                rooms("bedrooms"),
                rooms("bathrooms"),
                rooms("receptions"),
                Rule::repairable(
                    "postcode_format",
                    "postcode",
                    Check::Pattern {
                        regex: "[A-Z]{1,2}[0-9][A-Z0-9]? ?[0-9][A-Z]{2}".to_string(),
                    },
                    Repair::Drop,
                ),
                Rule::repairable(
                    "epc_rating_grade",
                    "epc_rating",
                    Check::OneOf {
                        values: ["A", "B", "C", "D", "E", "F", "G"]
                            .iter()
                            .map(|v| v.to_string())
                            .collect(),
                    },
                    Repair::Drop,
                ),
            ],
        }
    }

    fn carbon_intensity() -> Self {
        Self {
            version: 1,
            domain: SourceDomain::CarbonIntensity,
            rules: vec![
                Rule::fatal(
                    "forecast_physical_range",
                    "intensity_forecast",
                    range(Some(0.0), Some(CARBON_INTENSITY_MAX)),
                ),
                Rule::fatal(
                    "period_ordered",
                    "to",
                    Check::After {
                        field: "from".to_string(),
                    },
                ),
                Rule::repairable(
                    "actual_physical_range",
                    "intensity_actual",
                    range(Some(0.0), Some(CARBON_INTENSITY_MAX)),
                    Repair::Drop,
                ),
                Rule::repairable(
                    "renewable_share_range",
                    "renewable_percentage",
                    range(Some(0.0), Some(100.0)),
                    Repair::Clamp,
                ),
                Rule::repairable(
                    "index_known",
                    "intensity_index",
                    Check::OneOf {
                        values: INTENSITY_INDEXES.iter().map(|v| v.to_string()).collect(),
                    },
                    Repair::Bands {
                        from: "intensity_forecast".to_string(),
                        bands: [(100.0, "very low"), (200.0, "low"), (250.0, "moderate"), (300.0, "high")]
                            .iter()
                            .map(|(below, value)| Band {
                                below: *below,
                                value: value.to_string(),
                            })
                            .collect(),
                        otherwise: "very high".to_string(),
                    },
                ),
            ],
        }
    }
}

/// One component of an entity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    /// Lowercase, runs of non-alphanumerics collapsed to one space.
    NormalizedText(&'static str),
    /// Uppercase with whitespace removed; empty when absent.
    CompactUpper(&'static str),
    Integer(&'static str),
    /// Timestamp floored to a bucket of `minutes`.
    TimeBucket(&'static str, i64),
}

impl KeyPart {
    pub fn field(&self) -> &'static str {
        match self {
            KeyPart::NormalizedText(f)
            | KeyPart::CompactUpper(f)
            | KeyPart::Integer(f)
            | KeyPart::TimeBucket(f, _) => f,
        }
    }
}

/// Identity and projection layout of a domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSchema {
    pub domain: SourceDomain,
    pub key: Vec<KeyPart>,
    /// Attributes that must agree between observations of one entity.
    pub identity: Vec<&'static str>,
    /// Attributes whose changes are kept as history.
    pub tracked: Vec<&'static str>,
    /// `(field, list)`: every value `field` takes across observations of an
    /// entity is gathered into the sorted set `list`.
    pub collected: Vec<(&'static str, &'static str)>,
    pub columns: Vec<ColumnSpec>,
}

impl DomainSchema {
    pub fn for_domain(domain: SourceDomain) -> Self {
        use ValueKind::*;
        let columns = |cols: &[(&str, ValueKind)]| {
            cols.iter()
                .map(|(name, kind)| ColumnSpec::new(name, *kind))
                .collect::<Vec<_>>()
        };
        match domain {
            SourceDomain::PropertyListing => Self {
                domain,
                key: vec![
                    KeyPart::NormalizedText("address"),
                    KeyPart::CompactUpper("postcode"),
                ],
                identity: vec!["listing_url"],
                tracked: vec![
                    "price",
                    "title",
                    "description",
                    "bedrooms",
                    "bathrooms",
                    "receptions",
                    "epc_rating",
                    "tags",
                ],
                collected: Vec::new(),
                columns: columns(&[
                    ("address", Text),
                    ("postcode", Text),
                    ("price", Integer),
                    ("bedrooms", Integer),
                    ("bathrooms", Integer),
                    ("receptions", Integer),
                    ("epc_rating", Text),
                    ("title", Text),
                    ("listing_url", Text),
                    ("tags", List),
                ]),
            },
            SourceDomain::CarbonIntensity => Self {
                domain,
                key: vec![KeyPart::Integer("region_id"), KeyPart::TimeBucket("from", 30)],
                identity: vec!["shortname"],
                tracked: vec![
                    "intensity_forecast",
                    "intensity_actual",
                    "intensity_index",
                    "renewable_percentage",
                ],
                collected: vec![("postcode", "postcodes")],
                columns: columns(&[
                    ("region_id", Integer),
                    ("shortname", Text),
                    ("postcodes", List),
                    ("from", Timestamp),
                    ("to", Timestamp),
                    ("intensity_forecast", Integer),
                    ("intensity_actual", Integer),
                    ("intensity_index", Text),
                    ("renewable_percentage", Float),
                ]),
            },
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}
