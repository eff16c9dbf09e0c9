//! Run orchestration: fetch, flatten, project, publish, then notify.

use crate::flatten::flatten;
use crate::notify::{Mailer, Notification};
use crate::openfda::{self, PageSource};
use crate::sheets::{self, PublishError, SheetBackend};
use crate::table::{self, UnknownColumn};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// Why a run stopped. One variant per stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),
    #[error("fetch failed: {0:#}")]
    Fetch(anyhow::Error),
    #[error(transparent)]
    Projection(#[from] UnknownColumn),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Inputs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub initial_url: String,
    pub columns: Vec<&'static str>,
    pub spreadsheet: String,
    pub worksheet: String,
    pub batch_size: usize,
    pub now: DateTime<Utc>,
}

/// Counts from a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub reports: usize,
    pub rows: usize,
    pub batches: usize,
}

#[derive(Debug)]
pub enum Outcome {
    Succeeded(RunSummary),
    Failed(PipelineError),
}

/// Run every stage in order; the first failure aborts the rest.
pub async fn run(
    source: &dyn PageSource,
    backend: &dyn SheetBackend,
    settings: &RunSettings,
) -> Result<RunSummary, PipelineError> {
    let reports = openfda::fetch_all(source, &settings.initial_url)
        .await
        .map_err(PipelineError::Fetch)?;

    let rows = flatten(&reports);
    let output = table::project(&rows, &settings.columns, settings.now)?;
    info!(
        "Prepared {} rows x {} columns from {} reports",
        output.len(),
        output.headers.len(),
        reports.len()
    );
    if output.is_empty() {
        warn!("No reports matched the query; only the header will be published");
    }

    let writer = backend
        .open(&settings.spreadsheet, &settings.worksheet)
        .await
        .map_err(|cause| PublishError::Open {
            worksheet: settings.worksheet.clone(),
            cause,
        })?;
    let published = sheets::publish(writer.as_ref(), &output, settings.batch_size).await?;

    Ok(RunSummary {
        reports: reports.len(),
        rows: published.rows,
        batches: published.batches,
    })
}

/// Run the pipeline and send exactly one notification for its outcome.
///
/// The returned error is only for a notification that could not be sent.
pub async fn execute(
    source: &dyn PageSource,
    backend: &dyn SheetBackend,
    mailer: &dyn Mailer,
    settings: &RunSettings,
) -> Result<Outcome> {
    let outcome = match run(source, backend, settings).await {
        Ok(summary) => Outcome::Succeeded(summary),
        Err(e) => Outcome::Failed(e),
    };
    report(mailer, outcome).await
}

/// Log an outcome and send the matching notification.
pub async fn report(mailer: &dyn Mailer, outcome: Outcome) -> Result<Outcome> {
    match &outcome {
        Outcome::Succeeded(summary) => {
            mailer.send(&Notification::success()).await?;
            info!(
                "Run successful: {} reports, {} rows, {} batches",
                summary.reports, summary.rows, summary.batches
            );
        }
        Outcome::Failed(e) => {
            error!("Error: {}", e);
            mailer.send(&Notification::failure()).await?;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openfda::PageResponse;
    use crate::sheets::SheetWriter;
    use crate::table::default_selection;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    struct FakeSource {
        pages: HashMap<String, PageResponse>,
    }

    #[async_trait::async_trait]
    impl PageSource for FakeSource {
        async fn get(&self, url: &str) -> Result<PageResponse> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no page at {}", url))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SheetCall {
        Open(String, String),
        Clear,
        Update(usize),
        Append(usize),
    }

    #[derive(Clone, Default)]
    struct FakeBackend {
        calls: Arc<Mutex<Vec<SheetCall>>>,
        fail_on_write: Option<usize>,
        fail_open: bool,
    }

    impl FakeBackend {
        fn calls(&self) -> Vec<SheetCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct FakeWriter {
        backend: FakeBackend,
        writes: Mutex<usize>,
    }

    impl FakeWriter {
        fn write(&self, call: SheetCall) -> Result<()> {
            self.backend.calls.lock().unwrap().push(call);
            let mut writes = self.writes.lock().unwrap();
            *writes += 1;
            if self.backend.fail_on_write == Some(*writes) {
                anyhow::bail!("RESOURCE_EXHAUSTED: write quota exceeded");
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl SheetWriter for FakeWriter {
        async fn clear(&self) -> Result<()> {
            self.backend.calls.lock().unwrap().push(SheetCall::Clear);
            Ok(())
        }

        async fn update(&self, rows: &[Vec<String>]) -> Result<()> {
            self.write(SheetCall::Update(rows.len()))
        }

        async fn append_rows(&self, rows: &[Vec<String>]) -> Result<()> {
            self.write(SheetCall::Append(rows.len()))
        }
    }

    #[async_trait::async_trait]
    impl SheetBackend for FakeBackend {
        async fn open(&self, spreadsheet: &str, worksheet: &str) -> Result<Box<dyn SheetWriter>> {
            self.calls.lock().unwrap().push(SheetCall::Open(
                spreadsheet.to_string(),
                worksheet.to_string(),
            ));
            if self.fail_open {
                anyhow::bail!("invalid_grant: account not found");
            }
            Ok(Box::new(FakeWriter {
                backend: self.clone(),
                writes: Mutex::new(0),
            }))
        }
    }

    #[derive(Default)]
    struct FakeMailer {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    impl FakeMailer {
        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Mailer for FakeMailer {
        async fn send(&self, notification: &Notification) -> Result<()> {
            if self.fail {
                anyhow::bail!("535 authentication failed");
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Two pages: 3 reports with 2 drugs each on the first, 1 report without drugs on the second.
    fn two_page_source() -> FakeSource {
        let first: Vec<serde_json::Value> = (0..3)
            .map(|i| {
                serde_json::json!({
                    "safetyreportid": format!("r{}", i),
                    "patient": {
                        "patientonsetage": "5",
                        "drug": [{"medicinalproduct": "A"}, {"medicinalproduct": "B"}]
                    }
                })
            })
            .collect();
        let second = vec![serde_json::json!({ "safetyreportid": "r3", "patient": {} })];

        let mut pages = HashMap::new();
        pages.insert(
            "start".to_string(),
            PageResponse {
                status: 200,
                link: Some("<next>; rel=\"next\"".to_string()),
                body: serde_json::json!({ "results": first }).to_string(),
            },
        );
        pages.insert(
            "next".to_string(),
            PageResponse {
                status: 200,
                link: None,
                body: serde_json::json!({ "results": second }).to_string(),
            },
        );
        FakeSource { pages }
    }

    fn settings(batch_size: usize) -> RunSettings {
        RunSettings {
            initial_url: "start".to_string(),
            columns: default_selection(),
            spreadsheet: "book".to_string(),
            worksheet: "sheet".to_string(),
            batch_size,
            now: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
        }
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_success_single_batch() {
        let backend = FakeBackend::default();
        let mailer = FakeMailer::default();

        let outcome = execute(&two_page_source(), &backend, &mailer, &settings(10_000))
            .await
            .unwrap();

        match outcome {
            Outcome::Succeeded(summary) => {
                assert_eq!(summary, RunSummary { reports: 4, rows: 7, batches: 1 });
            }
            Outcome::Failed(e) => panic!("unexpected failure: {}", e),
        }
        assert_eq!(
            backend.calls(),
            vec![
                SheetCall::Open("book".to_string(), "sheet".to_string()),
                SheetCall::Clear,
                SheetCall::Update(8),
            ]
        );
        assert_eq!(mailer.sent(), vec![Notification::success()]);
    }

    #[tokio::test]
    async fn test_failure_on_second_batch() {
        let backend = FakeBackend {
            fail_on_write: Some(2),
            ..Default::default()
        };
        let mailer = FakeMailer::default();

        // 7 rows in batches of 3 -> 3 batches; the append for batch 2 fails.
        let outcome = execute(&two_page_source(), &backend, &mailer, &settings(3))
            .await
            .unwrap();

        match &outcome {
            Outcome::Failed(PipelineError::Publish(PublishError::Batch { batch, total, .. })) => {
                assert_eq!((*batch, *total), (2, 3));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            backend.calls(),
            vec![
                SheetCall::Open("book".to_string(), "sheet".to_string()),
                SheetCall::Clear,
                SheetCall::Update(4),
                SheetCall::Append(3),
            ]
        );
        assert_eq!(mailer.sent(), vec![Notification::failure()]);
    }

    #[tokio::test]
    async fn test_open_failure_reports_failure() {
        let backend = FakeBackend {
            fail_open: true,
            ..Default::default()
        };
        let mailer = FakeMailer::default();

        let outcome = execute(&two_page_source(), &backend, &mailer, &settings(10))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            Outcome::Failed(PipelineError::Publish(PublishError::Open { .. }))
        ));
        assert_eq!(mailer.sent(), vec![Notification::failure()]);
    }

    #[tokio::test]
    async fn test_unknown_column_aborts_before_publish() {
        let backend = FakeBackend::default();
        let mailer = FakeMailer::default();
        let mut settings = settings(10);
        settings.columns.push("patient.reaction");

        let outcome = execute(&two_page_source(), &backend, &mailer, &settings)
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Failed(PipelineError::Projection(_))));
        assert!(backend.calls().is_empty());
        assert_eq!(mailer.sent(), vec![Notification::failure()]);
    }

    #[tokio::test]
    async fn test_fetch_failure_reports_failure() {
        let mut pages = HashMap::new();
        pages.insert(
            "start".to_string(),
            PageResponse {
                status: 200,
                link: None,
                body: "<html>maintenance</html>".to_string(),
            },
        );
        let backend = FakeBackend::default();
        let mailer = FakeMailer::default();

        let outcome = execute(&FakeSource { pages }, &backend, &mailer, &settings(10))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Failed(PipelineError::Fetch(_))));
        assert!(backend.calls().is_empty());
        assert_eq!(mailer.sent(), vec![Notification::failure()]);
    }

    #[tokio::test]
    async fn test_notification_failure_surfaces() {
        let backend = FakeBackend::default();
        let mailer = FakeMailer {
            fail: true,
            ..Default::default()
        };

        let result = execute(&two_page_source(), &backend, &mailer, &settings(10)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_result_publishes_header_only() {
        let mut pages = HashMap::new();
        pages.insert(
            "start".to_string(),
            PageResponse {
                status: 200,
                link: None,
                body: serde_json::json!({ "results": [] }).to_string(),
            },
        );
        let backend = FakeBackend::default();
        let mailer = FakeMailer::default();

        let outcome = execute(&FakeSource { pages }, &backend, &mailer, &settings(10))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            Outcome::Succeeded(RunSummary { reports: 0, rows: 0, batches: 1 })
        ));
        assert_eq!(
            backend.calls(),
            vec![
                SheetCall::Open("book".to_string(), "sheet".to_string()),
                SheetCall::Clear,
                SheetCall::Update(1),
            ]
        );
        assert_eq!(mailer.sent(), vec![Notification::success()]);
    }
}
