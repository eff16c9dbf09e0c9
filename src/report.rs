//! Typed openFDA drug adverse-event records.
//!
//! Only the fields the output table uses are modelled; everything else in the
//! payload is ignored. Every field is optional because openFDA omits keys
//! rather than sending nulls. A nested value of the wrong shape decodes as
//! absent instead of rejecting the whole page.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

/// One adverse-event case report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Report {
    #[serde(default, deserialize_with = "text")]
    pub safetyreportversion: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub safetyreportid: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub primarysourcecountry: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub occurcountry: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub transmissiondateformat: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub transmissiondate: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub reporttype: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub serious: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub seriousnessdeath: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub seriousnesslifethreatening: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub seriousnesshospitalization: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub seriousnessdisabling: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub seriousnesscongenitalanomali: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub seriousnessother: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub receivedateformat: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub receivedate: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub receiptdateformat: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub receiptdate: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub fulfillexpeditecriteria: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub companynumb: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub duplicate: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub authoritynumb: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub patient: Option<Patient>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Patient {
    #[serde(default, deserialize_with = "text")]
    pub patientonsetage: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub patientonsetageunit: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub patientagegroup: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub patientsex: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub patientweight: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub summary: Option<Summary>,
    #[serde(default, deserialize_with = "lenient_drugs")]
    pub drug: Vec<Drug>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Summary {
    #[serde(default, deserialize_with = "text")]
    pub narrativeincludeclinical: Option<String>,
}

/// One suspect or concomitant drug within a report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Drug {
    #[serde(default, deserialize_with = "text")]
    pub drugcharacterization: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub medicinalproduct: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub drugdosagetext: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub drugdosageform: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub drugindication: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub actiondrug: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub drugadditional: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub drugauthorizationnumb: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub activesubstance: Option<ActiveSubstance>,
    #[serde(default, deserialize_with = "lenient")]
    pub openfda: Option<OpenFda>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActiveSubstance {
    #[serde(default, deserialize_with = "text")]
    pub activesubstancename: Option<String>,
}

/// Harmonized product fields openFDA attaches to a drug. All are lists.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenFda {
    #[serde(default, deserialize_with = "text_list")]
    pub application_number: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub brand_name: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub generic_name: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub manufacturer_name: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub product_type: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub route: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub substance_name: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub pharm_class_epc: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub pharm_class_moa: Option<Vec<String>>,
    #[serde(default, deserialize_with = "text_list")]
    pub pharm_class_cs: Option<Vec<String>>,
}

/// Render a JSON value as cell text. Strings pass through unquoted and
/// lists are joined with `", "`.
fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(value_to_text)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        other => Some(other.to_string()),
    }
}

fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(value_to_text))
}

/// Accepts either a list or a lone scalar (wrapped into a one-element list).
fn text_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(items.into_iter().filter_map(value_to_text).collect()),
        Some(scalar) => value_to_text(scalar).map(|s| vec![s]),
    })
}

/// Decode `value` as `T`, or log and drop it when the shape does not match.
fn decode_or_warn<T: DeserializeOwned>(value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(
                "Ignoring malformed {} value: {}",
                std::any::type_name::<T>().rsplit("::").next().unwrap_or("nested"),
                e
            );
            None
        }
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .filter(|v| !v.is_null())
        .and_then(decode_or_warn))
}

/// A malformed drug entry keeps its row with empty drug fields, so the
/// report-drug row count is unchanged.
fn lenient_drugs<'de, D>(deserializer: D) -> Result<Vec<Drug>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| decode_or_warn(item).unwrap_or_default())
            .collect(),
        Some(other) => {
            warn!("Ignoring drug value that is not a list: {}", other);
            Vec::new()
        }
    })
}

/// Decode a single report, or log and skip it when it is not an object.
pub fn decode_report(value: Value) -> Option<Report> {
    decode_or_warn(value)
}
