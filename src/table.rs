//! Column projection and cell sanitizing for the spreadsheet upload.
//!
//! The output columns are a fixed catalog: every column has a name and an
//! accessor that reads it from a [`FlatRow`]. Selecting a name that is not in
//! the catalog fails the run instead of silently producing an empty column.

use crate::flatten::FlatRow;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Longest cell the spreadsheet accepts, in characters.
pub const MAX_CELL_CHARS: usize = 49_999;

/// Name of the appended upload-time column.
pub const BATCH_COLUMN: &str = "batch_dttm";

/// Fixed shift applied to the upload timestamp.
pub const BATCH_OFFSET_HOURS: i64 = 8;

const LIST_SEPARATOR: &str = ", ";

/// A raw cell value before it is stringified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Text(String),
    List(Vec<String>),
}

impl Cell {
    /// Lists become `", "`-joined text; text passes through.
    pub fn into_text(self) -> String {
        match self {
            Cell::Text(s) => s,
            Cell::List(items) => items.join(LIST_SEPARATOR),
        }
    }
}

/// One named output column.
pub struct Column {
    pub name: &'static str,
    extract: fn(&FlatRow<'_>) -> Option<Cell>,
}

impl Column {
    pub fn value(&self, row: &FlatRow<'_>) -> Option<Cell> {
        (self.extract)(row)
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column").field("name", &self.name).finish()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected column '{0}' is not produced by the flattener")]
pub struct UnknownColumn(pub String);

/// The sanitized table: header names plus string rows of equal width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl OutputTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn text(value: &Option<String>) -> Option<Cell> {
    value.clone().map(Cell::Text)
}

fn list(value: &Option<Vec<String>>) -> Option<Cell> {
    value.clone().map(Cell::List)
}

/// Every column the flattener can produce, in output order.
pub const COLUMNS: &[Column] = &[
    Column { name: "safetyreportversion", extract: |r| text(&r.report.safetyreportversion) },
    Column { name: "safetyreportid", extract: |r| text(&r.report.safetyreportid) },
    Column { name: "primarysourcecountry", extract: |r| text(&r.report.primarysourcecountry) },
    Column { name: "occurcountry", extract: |r| text(&r.report.occurcountry) },
    Column { name: "transmissiondateformat", extract: |r| text(&r.report.transmissiondateformat) },
    Column { name: "transmissiondate", extract: |r| text(&r.report.transmissiondate) },
    Column { name: "reporttype", extract: |r| text(&r.report.reporttype) },
    Column { name: "serious", extract: |r| text(&r.report.serious) },
    Column { name: "seriousnessdeath", extract: |r| text(&r.report.seriousnessdeath) },
    Column { name: "seriousnesslifethreatening", extract: |r| text(&r.report.seriousnesslifethreatening) },
    Column { name: "seriousnesshospitalization", extract: |r| text(&r.report.seriousnesshospitalization) },
    Column { name: "seriousnessdisabling", extract: |r| text(&r.report.seriousnessdisabling) },
    Column { name: "seriousnesscongenitalanomali", extract: |r| text(&r.report.seriousnesscongenitalanomali) },
    Column { name: "seriousnessother", extract: |r| text(&r.report.seriousnessother) },
    Column { name: "receivedateformat", extract: |r| text(&r.report.receivedateformat) },
    Column { name: "receivedate", extract: |r| text(&r.report.receivedate) },
    Column { name: "receiptdateformat", extract: |r| text(&r.report.receiptdateformat) },
    Column { name: "receiptdate", extract: |r| text(&r.report.receiptdate) },
    Column { name: "fulfillexpeditecriteria", extract: |r| text(&r.report.fulfillexpeditecriteria) },
    Column { name: "companynumb", extract: |r| text(&r.report.companynumb) },
    Column { name: "duplicate", extract: |r| text(&r.report.duplicate) },
    Column { name: "authoritynumb", extract: |r| text(&r.report.authoritynumb) },
    Column { name: "patientonsetage", extract: |r| r.patient.and_then(|p| text(&p.patientonsetage)) },
    Column { name: "patientonsetageunit", extract: |r| r.patient.and_then(|p| text(&p.patientonsetageunit)) },
    Column { name: "patientagegroup", extract: |r| r.patient.and_then(|p| text(&p.patientagegroup)) },
    Column { name: "patientsex", extract: |r| r.patient.and_then(|p| text(&p.patientsex)) },
    Column { name: "patientweight", extract: |r| r.patient.and_then(|p| text(&p.patientweight)) },
    Column {
        name: "summary.narrativeincludeclinical",
        extract: |r| {
            r.patient
                .and_then(|p| p.summary.as_ref())
                .and_then(|s| text(&s.narrativeincludeclinical))
        },
    },
    Column { name: "drugcharacterization", extract: |r| r.drug.and_then(|d| text(&d.drugcharacterization)) },
    Column { name: "medicinalproduct", extract: |r| r.drug.and_then(|d| text(&d.medicinalproduct)) },
    Column { name: "drugdosagetext", extract: |r| r.drug.and_then(|d| text(&d.drugdosagetext)) },
    Column { name: "drugdosageform", extract: |r| r.drug.and_then(|d| text(&d.drugdosageform)) },
    Column { name: "drugindication", extract: |r| r.drug.and_then(|d| text(&d.drugindication)) },
    Column {
        name: "activesubstance.activesubstancename",
        extract: |r| {
            r.drug
                .and_then(|d| d.activesubstance.as_ref())
                .and_then(|a| text(&a.activesubstancename))
        },
    },
    Column { name: "openfda.application_number", extract: |r| openfda(r, |o| list(&o.application_number)) },
    Column { name: "openfda.brand_name", extract: |r| openfda(r, |o| list(&o.brand_name)) },
    Column { name: "openfda.generic_name", extract: |r| openfda(r, |o| list(&o.generic_name)) },
    Column { name: "openfda.manufacturer_name", extract: |r| openfda(r, |o| list(&o.manufacturer_name)) },
    Column { name: "openfda.product_type", extract: |r| openfda(r, |o| list(&o.product_type)) },
    Column { name: "openfda.route", extract: |r| openfda(r, |o| list(&o.route)) },
    Column { name: "openfda.substance_name", extract: |r| openfda(r, |o| list(&o.substance_name)) },
    Column { name: "openfda.pharm_class_epc", extract: |r| openfda(r, |o| list(&o.pharm_class_epc)) },
    Column { name: "actiondrug", extract: |r| r.drug.and_then(|d| text(&d.actiondrug)) },
    Column { name: "drugadditional", extract: |r| r.drug.and_then(|d| text(&d.drugadditional)) },
    Column { name: "drugauthorizationnumb", extract: |r| r.drug.and_then(|d| text(&d.drugauthorizationnumb)) },
    Column { name: "openfda.pharm_class_moa", extract: |r| openfda(r, |o| list(&o.pharm_class_moa)) },
    Column { name: "openfda.pharm_class_cs", extract: |r| openfda(r, |o| list(&o.pharm_class_cs)) },
];

fn openfda(
    row: &FlatRow<'_>,
    field: impl FnOnce(&crate::report::OpenFda) -> Option<Cell>,
) -> Option<Cell> {
    row.drug.and_then(|d| d.openfda.as_ref()).and_then(field)
}

/// Names of the columns uploaded on every run, in order.
pub fn default_selection() -> Vec<&'static str> {
    COLUMNS.iter().map(|c| c.name).collect()
}

/// Resolve selected names against the catalog, preserving selection order.
pub fn resolve_columns(selection: &[&str]) -> Result<Vec<&'static Column>, UnknownColumn> {
    selection
        .iter()
        .map(|name| {
            COLUMNS
                .iter()
                .find(|c| c.name == *name)
                .ok_or_else(|| UnknownColumn(name.to_string()))
        })
        .collect()
}

/// Upload timestamp: `now` shifted back by a fixed [`BATCH_OFFSET_HOURS`].
pub fn batch_timestamp(now: DateTime<Utc>) -> String {
    (now - Duration::hours(BATCH_OFFSET_HOURS))
        .naive_utc()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// Cut a cell down to at most [`MAX_CELL_CHARS`] characters.
pub fn truncate_cell(mut value: String) -> String {
    if let Some((byte_idx, _)) = value.char_indices().nth(MAX_CELL_CHARS) {
        value.truncate(byte_idx);
    }
    value
}

/// Build the upload table from flattened rows.
///
/// Missing values render as empty strings. The `batch_dttm` column is
/// always appended last with the same value on every row.
pub fn project(
    rows: &[FlatRow<'_>],
    selection: &[&str],
    now: DateTime<Utc>,
) -> Result<OutputTable, UnknownColumn> {
    let columns = resolve_columns(selection)?;
    let stamp = truncate_cell(batch_timestamp(now));

    let mut headers: Vec<String> = columns.iter().map(|c| c.name.to_string()).collect();
    headers.push(BATCH_COLUMN.to_string());

    let rows = rows
        .iter()
        .map(|row| {
            let mut cells: Vec<String> = columns
                .iter()
                .map(|column| {
                    let value = column.value(row).map(Cell::into_text).unwrap_or_default();
                    if value.chars().count() > MAX_CELL_CHARS {
                        debug!("Truncating {} on row {}", column.name, row.index);
                    }
                    truncate_cell(value)
                })
                .collect();
            cells.push(stamp.clone());
            cells
        })
        .collect();

    Ok(OutputTable { headers, rows })
}
