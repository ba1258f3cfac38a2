use hub_core::SourceDomain;

use crate::extract::{Coercion, DefaultPolicy, ExtractionTable, FieldRule, Locator};

pub const UK_POSTCODE_PATTERN: &str = r"([A-Z]{1,2}[0-9][A-Z0-9]? ?[0-9][A-Z]{2})";

pub const RENEWABLE_FUELS: [&str; 4] = ["wind", "solar", "hydro", "biomass"];

fn css(selector: &str) -> Locator {
    Locator::Css {
        selector: selector.to_string(),
    }
}

fn pointer(pointer: &str) -> Locator {
    Locator::JsonPointer {
        pointer: pointer.to_string(),
    }
}

fn room(selector: &str, contains: &str) -> Locator {
    Locator::CssMatching {
        selector: selector.to_string(),
        contains: contains.to_string(),
    }
}

pub fn builtin_table(domain: SourceDomain) -> ExtractionTable {
    match domain {
        SourceDomain::PropertyListing => property_listing_table(),
        SourceDomain::CarbonIntensity => carbon_intensity_table(),
    }
}

pub fn property_listing_table() -> ExtractionTable {
    use Coercion::*;
    use DefaultPolicy::*;

    let rooms = "ul.room-details li";
    ExtractionTable::new(
        SourceDomain::PropertyListing,
        vec![
            FieldRule::new("address", css("address"), Text, Required),
            FieldRule::new("price", css(".price"), Integer, Optional),
            FieldRule::new("title", css("h1"), Text, Optional),
            FieldRule::new("description", css("#detailed-desc"), Text, Optional),
            FieldRule::new("bedrooms", room(rooms, "bed"), Integer, Optional),
            FieldRule::new("bathrooms", room(rooms, "bath"), Integer, Optional),
            FieldRule::new("receptions", room(rooms, "reception"), Integer, Optional),
            FieldRule::new("epc_rating", css(".epc-rating"), Text, Optional)
                .capture(r"\b([A-Za-z])\s*$"),
            FieldRule::new(
                "image_url",
                Locator::CssAttr {
                    selector: "img.main-image".to_string(),
                    attr: "src".to_string(),
                },
                Text,
                Optional,
            ),
            FieldRule::new(
                "tags",
                Locator::CssAll {
                    selector: "ul.tags li".to_string(),
                },
                TextList,
                Optional,
            ),
            FieldRule::new(
                "postcode",
                Locator::Derived {
                    from: "address".to_string(),
                },
                Text,
                Optional,
            )
            .capture(UK_POSTCODE_PATTERN),
            FieldRule::new("listing_url", Locator::RecordLocator, Text, Optional),
        ],
    )
}

pub fn carbon_intensity_table() -> ExtractionTable {
    use Coercion::*;
    use DefaultPolicy::*;

    ExtractionTable::new(
        SourceDomain::CarbonIntensity,
        vec![
            FieldRule::new("region_id", pointer("/regionid"), Integer, Required),
            FieldRule::new("shortname", pointer("/shortname"), Text, Optional),
            FieldRule::new("dnoregion", pointer("/dnoregion"), Text, Optional),
            FieldRule::new("postcode", pointer("/postcode_queried"), Text, Optional),
            FieldRule::new("from", pointer("/from"), Timestamp, Required),
            FieldRule::new("to", pointer("/to"), Timestamp, Required),
            FieldRule::new("intensity_forecast", pointer("/intensity/forecast"), Integer, Required),
            FieldRule::new("intensity_actual", pointer("/intensity/actual"), Integer, Optional),
            FieldRule::new("intensity_index", pointer("/intensity/index"), Text, Optional),
            FieldRule::new(
                "renewable_percentage",
                pointer("/generationmix"),
                RenewableShare {
                    fuels: RENEWABLE_FUELS.iter().map(|f| f.to_string()).collect(),
                },
                Optional,
            ),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hub_core::{FieldValue, RawPayload, RawRecord};
    use serde_json::json;

    fn raw(payload: RawPayload) -> RawRecord {
        RawRecord {
            source_id: "fixture".into(),
            fetch_sequence: 4,
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).single().unwrap(),
            locator: "https://www.example-homes.test/for-sale/details/7001".into(),
            payload,
        }
    }

    #[test]
    fn property_detail_page_extracts_every_field() {
        let html = r#"
            <html><body>
              <h1>2 bed flat for sale</h1>
              <address>Flat 3, 18 Old Street, London EC1V 9HL</address>
              <p class="price">£625,000</p>
              <ul class="room-details">
                <li><p>2 beds</p></li><li><p>1 bath</p></li><li><p>1 reception</p></li>
              </ul>
              <div id="detailed-desc">Bright flat   near the roundabout.</div>
              <ul class="epc"><li class="epc-rating"><p>EPC Rating: C</p></li></ul>
              <img class="main-image" src="https://img.example.test/7001.jpg">
              <ul class="tags"><li>Balcony</li><li>Chain free</li></ul>
            </body></html>"#;
        let record = property_listing_table()
            .extract(&raw(RawPayload::html(html)))
            .expect("extracts");

        assert_eq!(record.get("price"), Some(&FieldValue::Integer(625_000)));
        assert_eq!(record.get("bedrooms"), Some(&FieldValue::Integer(2)));
        assert_eq!(record.get("bathrooms"), Some(&FieldValue::Integer(1)));
        assert_eq!(record.get("receptions"), Some(&FieldValue::Integer(1)));
        assert_eq!(record.text("epc_rating"), Some("C"));
        assert_eq!(record.text("postcode"), Some("EC1V 9HL"));
        assert_eq!(record.text("description"), Some("Bright flat near the roundabout."));
        assert_eq!(
            record.get("tags"),
            Some(&FieldValue::List(vec!["Balcony".into(), "Chain free".into()]))
        );
        assert_eq!(
            record.text("listing_url"),
            Some("https://www.example-homes.test/for-sale/details/7001")
        );
    }

    #[test]
    fn carbon_window_extracts_intensity_and_renewables() {
        let window = json!({
            "regionid": 13,
            "shortname": "London",
            "dnoregion": "UKPN London",
            "region_id_queried": 13,
            "from": "2026-10-18T12:00Z",
            "to": "2026-10-18T12:30Z",
            "intensity": {"forecast": 0, "index": "very low"},
            "generationmix": [
                {"fuel": "wind", "perc": 40.1},
                {"fuel": "hydro", "perc": 2.0},
                {"fuel": "biomass", "perc": 5.55},
                {"fuel": "solar", "perc": 3.0},
                {"fuel": "gas", "perc": 30.0}
            ]
        });
        let record = carbon_intensity_table()
            .extract(&raw(RawPayload::Tree { value: window }))
            .expect("extracts");

        assert_eq!(record.get("intensity_forecast"), Some(&FieldValue::Integer(0)));
        assert_eq!(record.get("region_id"), Some(&FieldValue::Integer(13)));
        assert_eq!(record.number("renewable_percentage"), Some(50.65));
        assert!(record.get("intensity_actual").is_none());
    }

    #[test]
    fn carbon_window_without_period_is_an_extract_failure() {
        let err = carbon_intensity_table()
            .extract(&raw(RawPayload::Tree {
                value: json!({"regionid": 13, "intensity": {"forecast": 120}}),
            }))
            .unwrap_err();
        assert_eq!(err.fields, vec!["from".to_string(), "to".to_string()]);
    }
}
