//! Report flattening: one row per (report, drug) pair.

use crate::report::{Drug, Patient, Report};

/// A flattened view over one report and at most one of its drugs.
///
/// Rows borrow from the fetched reports, so patient-level values are shared
/// by every drug row of the same report rather than copied.
#[derive(Debug, Clone, Copy)]
pub struct FlatRow<'a> {
    /// Dense, 0-based position in the flattened output.
    pub index: usize,
    pub report: &'a Report,
    pub patient: Option<&'a Patient>,
    pub drug: Option<&'a Drug>,
}

/// Explode every report into one row per drug.
///
/// A report without a patient, or whose drug list is empty, still yields a
/// single row with no drug attached.
pub fn flatten(reports: &[Report]) -> Vec<FlatRow<'_>> {
    let mut rows = Vec::with_capacity(reports.len());

    for report in reports {
        let patient = report.patient.as_ref();
        let drugs = patient.map(|p| p.drug.as_slice()).unwrap_or_default();

        if drugs.is_empty() {
            rows.push(FlatRow {
                index: rows.len(),
                report,
                patient,
                drug: None,
            });
            continue;
        }

        for drug in drugs {
            rows.push(FlatRow {
                index: rows.len(),
                report,
                patient,
                drug: Some(drug),
            });
        }
    }

    tracing::debug!(
        "Flattened {} reports into {} report-drug rows",
        reports.len(),
        rows.len()
    );
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, drugs: &[&str]) -> Report {
        let drug_json: Vec<serde_json::Value> = drugs
            .iter()
            .map(|name| serde_json::json!({ "medicinalproduct": name }))
            .collect();
        serde_json::from_value(serde_json::json!({
            "safetyreportid": id,
            "patient": { "patientsex": "1", "drug": drug_json }
        }))
        .unwrap()
    }

    #[test]
    fn test_one_row_per_drug() {
        let reports = vec![report("A", &["X", "Y", "Z"])];
        let rows = flatten(&reports);
        assert_eq!(rows.len(), 3);

        let products: Vec<_> = rows
            .iter()
            .map(|r| r.drug.and_then(|d| d.medicinalproduct.as_deref()))
            .collect();
        assert_eq!(products, vec![Some("X"), Some("Y"), Some("Z")]);

        for row in &rows {
            assert_eq!(row.report.safetyreportid.as_deref(), Some("A"));
            assert_eq!(
                row.patient.and_then(|p| p.patientsex.as_deref()),
                Some("1")
            );
        }
    }

    #[test]
    fn test_empty_drug_list_keeps_single_row() {
        let reports = vec![report("A", &[])];
        let rows = flatten(&reports);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].drug.is_none());
        assert!(rows[0].patient.is_some());
    }

    #[test]
    fn test_missing_patient_keeps_single_row() {
        let reports = vec![Report::default()];
        let rows = flatten(&reports);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].patient.is_none());
        assert!(rows[0].drug.is_none());
    }

    #[test]
    fn test_dense_index_across_reports() {
        let reports = vec![report("A", &["X", "Y"]), report("B", &[]), report("C", &["Z"])];
        let rows = flatten(&reports);
        let indexes: Vec<usize> = rows.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(rows[2].report.safetyreportid.as_deref(), Some("B"));
        assert_eq!(rows[3].report.safetyreportid.as_deref(), Some("C"));
    }
}
