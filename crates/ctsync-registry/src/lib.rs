//! Registry client for ClinicalTrials.gov: paginated fetch, record normalization
//! and best-effort page enrichment.

use async_trait::async_trait;
use ctsync_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, Instrument};

mod enrich;
mod normalize;

pub use enrich::{
    enrich_batch, Enricher, EnrichmentError, EnrichmentOutcome, FirecrawlEnricher,
    StudyPageEnricher, DEFAULT_FIRECRAWL_API_URL,
};
pub use normalize::{normalize, RecordError};

pub const CRATE_NAME: &str = "ctsync-registry";

pub const DEFAULT_REGISTRY_URL: &str = "https://clinicaltrials.gov/api/v2/studies";
pub const DEFAULT_STUDY_PAGE_BASE: &str = "https://clinicaltrials.gov/study";

/// Hard cap the registry enforces on `pageSize`.
pub const REGISTRY_MAX_PAGE_SIZE: usize = 1000;

/// Page size `fetch_all` asks for.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Rewrites applied after title-casing, in order. Left side is matched as a
/// substring of the title-cased term.
pub const SEARCH_TERM_REWRITES: &[(&str, &str)] = &[
    ("Alzheimers", "Alzheimer's"),
    ("Parkinsons", "Parkinson's"),
    ("Type 2 Diabetes", "Diabetes Mellitus, Type 2"),
    ("Diabetes Type 2", "Diabetes Mellitus, Type 2"),
];

/// One study object exactly as the registry returned it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub JsonValue);

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryPage {
    pub records: Vec<RawRecord>,
    pub next_page_token: Option<String>,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery<'a> {
    pub search_term: &'a str,
    pub status: &'a str,
    pub page_size: usize,
    pub page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudiesResponse {
    #[serde(default)]
    studies: Vec<RawRecord>,
    next_page_token: Option<String>,
    #[serde(default)]
    total_count: u64,
}

/// Turn an internal condition key (`alzheimers_disease`) into the phrasing the
/// registry matches best (`Alzheimer's Disease`).
pub fn format_search_term(term: &str) -> String {
    let spaced = term.replace('_', " ");
    let mut formatted = String::with_capacity(spaced.len());
    let mut previous_alpha = false;
    for ch in spaced.chars() {
        if ch.is_alphabetic() {
            if previous_alpha {
                formatted.extend(ch.to_lowercase());
            } else {
                formatted.extend(ch.to_uppercase());
            }
            previous_alpha = true;
        } else {
            formatted.push(ch);
            previous_alpha = false;
        }
    }

    for (from, to) in SEARCH_TERM_REWRITES {
        if formatted.contains(from) {
            formatted = formatted.replace(from, to);
        }
    }
    formatted
}

#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<RegistryPage, FetchError>;
}

/// Page through the registry until `max_records` are collected, the registry
/// stops handing out page tokens, or a page comes back empty.
pub async fn fetch_all(
    source: &dyn RegistrySource,
    search_term: &str,
    status: &str,
    max_records: usize,
) -> Result<Vec<RawRecord>, FetchError> {
    let mut records: Vec<RawRecord> = Vec::new();
    let mut page_token: Option<String> = None;

    while records.len() < max_records {
        let page_size = DEFAULT_PAGE_SIZE.min(max_records - records.len());
        let page = source
            .fetch_page(&PageQuery {
                search_term,
                status,
                page_size,
                page_token: page_token.as_deref(),
            })
            .await?;

        let page_len = page.records.len();
        records.extend(page.records);
        debug!(page_len, accumulated = records.len(), total = page.total_count, "registry page");

        match page.next_page_token {
            Some(token) if page_len > 0 => page_token = Some(token),
            _ => break,
        }
    }

    records.truncate(max_records);
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct ClinicalTrialsClient {
    http: HttpFetcher,
    base_url: String,
}

impl ClinicalTrialsClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch_by_id(&self, nct_id: &str) -> Result<RawRecord, FetchError> {
        let url = format!("{}/{}", self.base_url, nct_id);
        self.http.get_json(&url, &[]).await
    }
}

#[async_trait]
impl RegistrySource for ClinicalTrialsClient {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<RegistryPage, FetchError> {
        let condition = format_search_term(query.search_term);
        let page_size = query.page_size.clamp(1, REGISTRY_MAX_PAGE_SIZE);
        let mut params = vec![
            ("query.cond", condition.clone()),
            ("filter.overallStatus", query.status.to_ascii_uppercase()),
            ("pageSize", page_size.to_string()),
            ("countTotal", "true".to_string()),
        ];
        if let Some(token) = query.page_token {
            params.push(("pageToken", token.to_string()));
        }

        let span = info_span!("registry_fetch", condition = %condition, status = query.status, page_size);
        async move {
            let body: StudiesResponse = self.http.get_json(&self.base_url, &params).await?;
            info!(found = body.studies.len(), "fetched registry page");
            Ok(RegistryPage {
                records: body.studies,
                next_page_token: body.next_page_token.filter(|t| !t.is_empty()),
                total_count: body.total_count,
            })
        }
        .instrument(span)
        .await
    }
}
