//! Listing sources: the `JobSource` contract plus HTML table adapters.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use shiftwatch_core::{snapshot_from_records, JobRecord, Snapshot};
use shiftwatch_storage::{FetchError, HttpClient, PageArchive};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "shiftwatch-adapters";

pub const DEFAULT_SOURCE_URL: &str = "https://splendid.onsinch.com/react/position";

/// Rows of the positions table; header rows lack the hover class.
pub const ROW_SELECTOR: &str = "tr.MuiTableRow-root.MuiTableRow-hover";

/// Title, date, time, location, profession, occupancy.
pub const LISTING_COLUMNS: usize = 6;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching listing page: {0}")]
    Fetch(#[from] FetchError),
    #[error("reading listing file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Produces one snapshot of the listing page per call.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_snapshot(&self) -> Result<Snapshot, SourceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTable {
    pub records: Vec<JobRecord>,
    /// Matching rows with fewer than [`LISTING_COLUMNS`] cells.
    pub skipped_rows: usize,
}

impl ParsedTable {
    pub fn into_snapshot(self) -> Snapshot {
        let rows = self.records.len();
        let snapshot = snapshot_from_records(self.records);
        if snapshot.len() < rows {
            debug!(rows, unique = snapshot.len(), "duplicate listing rows collapsed");
        }
        snapshot
    }
}

fn selector(raw: &str) -> Result<Selector, SourceError> {
    Selector::parse(raw).map_err(|e| SourceError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

/// Cell text with all whitespace runs collapsed to one space, so no field can contain the key delimiter.
fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve_link(href: &str, base_url: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match Url::parse(href) {
        Ok(url) => Some(url.to_string()),
        Err(_) => base_url.and_then(|base| base.join(href).ok()).map(|u| u.to_string()),
    }
}

/// Parse the positions table into records, in page order.
pub fn parse_job_table(html: &str, base_url: Option<&Url>) -> Result<ParsedTable, SourceError> {
    let document = Html::parse_document(html);
    let row_sel = selector(ROW_SELECTOR)?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a[href]")?;

    let mut parsed = ParsedTable::default();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(cell_text).collect();
        if cells.len() < LISTING_COLUMNS {
            parsed.skipped_rows += 1;
            continue;
        }

        let mut record = JobRecord::from_listing(
            cells[0].as_str(),
            cells[1].as_str(),
            cells[2].as_str(),
            cells[3].as_str(),
            cells[4].as_str(),
            cells[5].as_str(),
        );
        if let Some(link) = row
            .select(&link_sel)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|href| resolve_link(href, base_url))
        {
            record = record.with_link(link);
        }
        if let Some(id) = row
            .value()
            .attr("data-id")
            .or_else(|| row.value().attr("data-job-id"))
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            record = record.with_job_id(id);
        }
        parsed.records.push(record);
    }

    if parsed.skipped_rows > 0 {
        warn!(skipped = parsed.skipped_rows, "listing rows with too few cells were skipped");
    }
    Ok(parsed)
}

/// Fetches the positions page over HTTP, optionally archiving each raw page.
#[derive(Debug, Clone)]
pub struct HttpTableSource {
    http: HttpClient,
    url: String,
    archive: Option<PageArchive>,
}

impl HttpTableSource {
    pub fn new(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl JobSource for HttpTableSource {
    fn source_id(&self) -> &str {
        "http-table"
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, SourceError> {
        let response = self.http.get_bytes(&self.url).await?;

        if let Some(archive) = &self.archive {
            match archive.store_page(&response.body).await {
                Ok(page) => debug!(
                    path = %page.path.display(),
                    deduplicated = page.deduplicated,
                    "archived listing page"
                ),
                Err(err) => warn!(error = %err, "failed to archive listing page"),
            }
        }

        let html = String::from_utf8_lossy(&response.body);
        let base = Url::parse(&response.final_url).ok();
        let parsed = parse_job_table(&html, base.as_ref())?;
        info!(
            url = %response.final_url,
            rows = parsed.records.len(),
            skipped = parsed.skipped_rows,
            "parsed listing page"
        );
        Ok(parsed.into_snapshot())
    }
}

/// Reads a saved copy of the positions page; used for offline runs and fixtures.
#[derive(Debug, Clone)]
pub struct FileTableSource {
    path: PathBuf,
    base_url: Option<Url>,
}

impl FileTableSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            base_url: None,
        }
    }

    /// Base used to resolve relative row links; an unparsable base is ignored.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        match Url::parse(base_url) {
            Ok(url) => self.base_url = Some(url),
            Err(err) => warn!(%base_url, error = %err, "ignoring invalid base url"),
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobSource for FileTableSource {
    fn source_id(&self) -> &str {
        "file-table"
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, SourceError> {
        let html = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let parsed = parse_job_table(&html, self.base_url.as_ref())?;
        info!(path = %self.path.display(), rows = parsed.records.len(), "parsed listing file");
        Ok(parsed.into_snapshot())
    }
}
