//! openFDA drug adverse-event client with Link-header pagination.
//!
//! See <https://open.fda.gov/apis/paging/>: each page carries a `Link` header
//! pointing to the next one, and the last page has none.

use crate::dates::DateRange;
use crate::report::{self, Report};
use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const EVENT_ENDPOINT: &str = "https://api.fda.gov/drug/event.json";

/// Largest page size the API allows.
pub const PAGE_LIMIT: u32 = 1000;

/// Onset ages (in years) considered pediatric.
pub const MIN_PATIENT_AGE: u32 = 0;
pub const MAX_PATIENT_AGE: u32 = 17;

/// Raw result of one page request.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub link: Option<String>,
    pub body: String,
}

/// Anything that can GET a page URL.
#[async_trait::async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, url: &str) -> Result<PageResponse>;
}

#[derive(Deserialize)]
struct EventPage {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// HTTP-backed page source.
#[derive(Clone, Default)]
pub struct OpenFdaClient {
    client: Client,
}

impl OpenFdaClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PageSource for OpenFdaClient {
    async fn get(&self, url: &str) -> Result<PageResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request to openFDA")?;

        let status = response.status().as_u16();
        let link = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .context("Failed to read openFDA response body")?;

        Ok(PageResponse { status, link, body })
    }
}

/// First-page URL: received within `range`, patient onset age 0–17.
pub fn search_url(range: &DateRange) -> String {
    format!(
        "{}?search=(receivedate:[{}+TO+{}])+AND+(patient.patientonsetage:[{}+TO+{}])&limit={}",
        EVENT_ENDPOINT, range.from, range.to, MIN_PATIENT_AGE, MAX_PATIENT_AGE, PAGE_LIMIT
    )
}

/// Pull the first `<...>` URL out of a `Link` header value.
pub fn next_page_url(link_header: &str) -> Option<String> {
    let re = Regex::new(r"<(.*?)>").ok()?;
    re.captures(link_header)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|url| !url.is_empty())
}

/// Follow the page chain from `initial_url` and collect every report.
///
/// Non-200 pages are logged and contribute nothing, but their own `Link`
/// header still decides whether another page is requested. A request that
/// gets no response at all ends pagination. Records that are not objects are
/// skipped. Only an unparseable 200 body is an error.
pub async fn fetch_all(source: &dyn PageSource, initial_url: &str) -> Result<Vec<Report>> {
    let mut reports: Vec<Report> = Vec::new();
    let mut report_ids: HashSet<String> = HashSet::new();
    let mut next = Some(initial_url.to_string());
    let mut page_num = 0usize;

    while let Some(url) = next.take() {
        page_num += 1;
        debug!("Requesting page {}: {}", page_num, url);

        let page = match source.get(&url).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Page {} request failed, stopping pagination: {:#}", page_num, e);
                break;
            }
        };

        next = page.link.as_deref().and_then(next_page_url);

        if page.status != 200 {
            warn!("Failed to retrieve data. Status code: {}", page.status);
            continue;
        }

        let parsed: EventPage = serde_json::from_str(&page.body)
            .with_context(|| format!("Failed to parse openFDA page {}", page_num))?;

        let received = parsed.results.len();
        let decoded: Vec<Report> = parsed
            .results
            .into_iter()
            .filter_map(report::decode_report)
            .collect();
        if decoded.len() < received {
            warn!(
                "Skipped {} malformed record(s) on page {}",
                received - decoded.len(),
                page_num
            );
        }

        report_ids.extend(decoded.iter().filter_map(|r| r.safetyreportid.clone()));
        reports.extend(decoded);

        info!(
            "Reports collected: {}; unique safetyreportids: {}",
            reports.len(),
            report_ids.len()
        );
    }

    info!("Pagination finished after {} page(s)", page_num);
    Ok(reports)
}
