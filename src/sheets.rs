//! Google Sheets publishing.
//!
//! The worksheet is cleared and rewritten on every run: the header plus the
//! first batch go in as one update anchored at `A1`, later batches are
//! appended below.

use crate::google_auth::ServiceAccountAuth;
use crate::table::OutputTable;
use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

/// Write operations against one worksheet.
#[async_trait::async_trait]
pub trait SheetWriter: Send + Sync {
    /// Remove every value from the worksheet.
    async fn clear(&self) -> Result<()>;
    /// Overwrite starting at the worksheet origin.
    async fn update(&self, rows: &[Vec<String>]) -> Result<()>;
    /// Add rows after the last non-empty row.
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<()>;
}

/// Resolves spreadsheet and worksheet names to a writable worksheet.
#[async_trait::async_trait]
pub trait SheetBackend: Send + Sync {
    async fn open(&self, spreadsheet: &str, worksheet: &str) -> Result<Box<dyn SheetWriter>>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to open worksheet '{worksheet}': {cause:#}")]
    Open {
        worksheet: String,
        cause: anyhow::Error,
    },
    #[error("failed to clear worksheet: {0:#}")]
    Clear(anyhow::Error),
    #[error("failed to upload batch {batch} of {total}: {cause:#}")]
    Batch {
        batch: usize,
        total: usize,
        cause: anyhow::Error,
    },
}

/// What a successful publish wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    pub rows: usize,
    pub batches: usize,
}

/// Number of batches scheduled for `rows` rows.
///
/// Always `rows / batch_size + 1`, so an exact multiple schedules one
/// trailing batch with no rows; [`publish`] skips the request for it.
pub fn batch_count(rows: usize, batch_size: usize) -> usize {
    rows / batch_size.max(1) + 1
}

/// Clear the worksheet and upload `table` in batches of `batch_size` rows.
///
/// Stops at the first failed write; nothing after it is attempted.
pub async fn publish(
    writer: &dyn SheetWriter,
    table: &OutputTable,
    batch_size: usize,
) -> Result<PublishSummary, PublishError> {
    let batch_size = batch_size.max(1);
    let total = batch_count(table.len(), batch_size);

    writer.clear().await.map_err(PublishError::Clear)?;

    for i in 0..total {
        let start = (i * batch_size).min(table.len());
        let end = ((i + 1) * batch_size).min(table.len());
        let batch = &table.rows[start..end];

        let result = if i == 0 {
            let mut rows = Vec::with_capacity(batch.len() + 1);
            rows.push(table.headers.clone());
            rows.extend_from_slice(batch);
            writer.update(&rows).await
        } else if batch.is_empty() {
            debug!("Batch {} of {} has no rows, nothing to append", i + 1, total);
            Ok(())
        } else {
            writer.append_rows(batch).await
        };

        result.map_err(|cause| PublishError::Batch {
            batch: i + 1,
            total,
            cause,
        })?;

        info!("Batch {} of {} uploaded.", i + 1, total);
    }

    Ok(PublishSummary {
        rows: table.len(),
        batches: total,
    })
}

// ============================================================================
// Google Sheets backend
// ============================================================================

/// Sheets/Drive REST client authenticated as a service account.
#[derive(Clone)]
pub struct GoogleSheets {
    client: Client,
    auth: Arc<ServiceAccountAuth>,
}

impl GoogleSheets {
    pub fn new(auth: ServiceAccountAuth) -> Self {
        Self {
            client: Client::new(),
            auth: Arc::new(auth),
        }
    }

    /// Find a spreadsheet id by exact file name via the Drive API.
    async fn find_spreadsheet(&self, name: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct FileList {
            #[serde(default)]
            files: Vec<DriveFile>,
        }

        #[derive(Deserialize)]
        struct DriveFile {
            id: String,
        }

        let token = self.auth.access_token(&self.client).await?;
        let query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            escape_query_value(name),
            SPREADSHEET_MIME
        );

        let list: FileList = self
            .client
            .get(DRIVE_FILES_URL)
            .bearer_auth(&token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .context("Failed to query Drive for spreadsheet")?
            .error_for_status()
            .context("Drive file search returned error")?
            .json()
            .await
            .context("Failed to parse Drive file list")?;

        list.files
            .into_iter()
            .next()
            .map(|f| f.id)
            .ok_or_else(|| anyhow!("Spreadsheet not found: {}", name))
    }

    /// Confirm a worksheet with `title` exists in the spreadsheet.
    async fn find_worksheet(&self, spreadsheet_id: &str, title: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct Spreadsheet {
            #[serde(default)]
            sheets: Vec<SheetEntry>,
        }

        #[derive(Deserialize)]
        struct SheetEntry {
            properties: SheetProperties,
        }

        #[derive(Deserialize)]
        struct SheetProperties {
            title: String,
        }

        let token = self.auth.access_token(&self.client).await?;
        let url = format!("{}/{}", SHEETS_API_URL, spreadsheet_id);

        let spreadsheet: Spreadsheet = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("fields", "sheets.properties(sheetId,title)")])
            .send()
            .await
            .context("Failed to fetch spreadsheet metadata")?
            .error_for_status()
            .context("Spreadsheet metadata request returned error")?
            .json()
            .await
            .context("Failed to parse spreadsheet metadata")?;

        if spreadsheet.sheets.iter().any(|s| s.properties.title == title) {
            Ok(())
        } else {
            anyhow::bail!("Worksheet not found: {}", title)
        }
    }
}

#[async_trait::async_trait]
impl SheetBackend for GoogleSheets {
    async fn open(&self, spreadsheet: &str, worksheet: &str) -> Result<Box<dyn SheetWriter>> {
        let spreadsheet_id = self.find_spreadsheet(spreadsheet).await?;
        self.find_worksheet(&spreadsheet_id, worksheet).await?;
        info!(
            "Opened worksheet '{}' in spreadsheet '{}' ({})",
            worksheet, spreadsheet, spreadsheet_id
        );

        Ok(Box::new(Worksheet {
            client: self.client.clone(),
            auth: Arc::clone(&self.auth),
            spreadsheet_id,
            title: worksheet.to_string(),
        }))
    }
}

/// One opened worksheet.
pub struct Worksheet {
    client: Client,
    auth: Arc<ServiceAccountAuth>,
    spreadsheet_id: String,
    title: String,
}

impl Worksheet {
    fn values_url(&self, range: &str, suffix: &str) -> Result<Url> {
        values_url(&self.spreadsheet_id, range, suffix)
    }

    async fn send_values(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<()> {
        let token = self.auth.access_token(&self.client).await?;
        let resp = request
            .bearer_auth(&token)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Sheets {} error ({}): {}", what, status, text);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SheetWriter for Worksheet {
    async fn clear(&self) -> Result<()> {
        let url = self.values_url(&quote_sheet_title(&self.title), ":clear")?;
        debug!("Clearing worksheet '{}'", self.title);
        self.send_values(self.client.post(url).json(&json!({})), "clear")
            .await
    }

    async fn update(&self, rows: &[Vec<String>]) -> Result<()> {
        let range = format!("{}!A1", quote_sheet_title(&self.title));
        let url = self.values_url(&range, "")?;
        let body = json!({ "majorDimension": "ROWS", "values": rows });
        debug!("Updating {} rows from origin of '{}'", rows.len(), self.title);
        self.send_values(
            self.client
                .put(url)
                .query(&[("valueInputOption", "RAW")])
                .json(&body),
            "update",
        )
        .await
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<()> {
        let range = format!("{}!A1", quote_sheet_title(&self.title));
        let url = self.values_url(&range, ":append")?;
        let body = json!({ "majorDimension": "ROWS", "values": rows });
        debug!("Appending {} rows to '{}'", rows.len(), self.title);
        self.send_values(
            self.client
                .post(url)
                .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                .json(&body),
            "append",
        )
        .await
    }
}

/// A1-notation sheet name, quoted so spaces and punctuation are safe.
fn quote_sheet_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// `.../spreadsheets/{id}/values/{range}{suffix}` with the range percent-encoded.
fn values_url(spreadsheet_id: &str, range: &str, suffix: &str) -> Result<Url> {
    let mut url = Url::parse(SHEETS_API_URL).context("Invalid Sheets API base URL")?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Sheets API base URL cannot have path segments"))?
        .push(spreadsheet_id)
        .push("values")
        .push(&format!("{}{}", range, suffix));
    Ok(url)
}
