//! Pediatric adverse-event sync - pulls the last 180 days of openFDA drug
//! adverse-event reports for patients aged 0-17, flattens them to one row per
//! report-drug pair, publishes them to a Google Sheet and emails the outcome.

mod config;
mod dates;
mod flatten;
mod google_auth;
mod notify;
mod openfda;
mod pipeline;
mod report;
mod sheets;
mod table;

use anyhow::Context;
use chrono::Utc;
use config::{MailConfig, SheetConfig};
use google_auth::{ServiceAccountAuth, ServiceAccountKey};
use notify::SmtpMailer;
use openfda::OpenFdaClient;
use pipeline::{Outcome, PipelineError, RunSettings};
use sheets::GoogleSheets;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "pediatric_ae_sync=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let run_id = uuid::Uuid::new_v4();
    let outcome = async_run().instrument(info_span!("run", %run_id)).await?;

    match outcome {
        Outcome::Succeeded(_) => {
            info!("Run {} finished successfully", run_id);
            Ok(())
        }
        Outcome::Failed(e) => anyhow::bail!("run {} failed: {}", run_id, e),
    }
}

/// Validate configuration, run the pipeline, notify.
///
/// Returns `Err` only when no notification could be delivered.
async fn async_run() -> anyhow::Result<Outcome> {
    // Without mail settings there is nobody to tell, so this fails outright.
    let mail = MailConfig::from_env().context("Invalid mail configuration")?;
    let mailer = SmtpMailer::new(&mail)?;
    info!("Notifications go to {}", mail.recipient);

    let (sheet, backend) = match load_sheet_backend() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return pipeline::report(&mailer, Outcome::Failed(PipelineError::Config(e))).await;
        }
    };

    let now = Utc::now();
    let range = dates::trailing_window(now.date_naive());
    info!("Fetching reports received {} to {}", range.from, range.to);

    let settings = RunSettings {
        initial_url: openfda::search_url(&range),
        columns: table::default_selection(),
        spreadsheet: sheet.spreadsheet,
        worksheet: sheet.worksheet,
        batch_size: sheet.batch_size,
        now,
    };

    pipeline::execute(&OpenFdaClient::new(), &backend, &mailer, &settings)
        .await
        .map_err(|e| {
            error!("Notification could not be sent: {:#}", e);
            e
        })
}

fn load_sheet_backend() -> anyhow::Result<(SheetConfig, GoogleSheets)> {
    let sheet = SheetConfig::from_env()?;
    let key = ServiceAccountKey::from_file(&sheet.credentials_path)?;
    info!("Using service account {}", key.client_email);
    Ok((sheet, GoogleSheets::new(ServiceAccountAuth::new(key))))
}
