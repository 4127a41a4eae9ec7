//! Best-effort enrichment of a study with the text of its public page.

use std::time::Duration;

use async_trait::async_trait;
use ctsync_storage::{FetchError, HttpFetcher};
use futures::future::join_all;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_FIRECRAWL_API_URL: &str = "https://api.firecrawl.dev/v1/scrape";

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("scrape rejected: {0}")]
    Rejected(String),
    #[error("page had no readable content")]
    Empty,
}

/// Result of one enrichment attempt. A failure here is an expected outcome,
/// not a pipeline error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichmentOutcome {
    pub nct_id: String,
    pub success: bool,
    pub text: Option<String>,
    pub error: Option<String>,
}

impl EnrichmentOutcome {
    pub fn succeeded(nct_id: &str, text: String) -> Self {
        Self {
            nct_id: nct_id.to_string(),
            success: true,
            text: Some(text),
            error: None,
        }
    }

    pub fn failed(nct_id: &str, error: impl ToString) -> Self {
        Self {
            nct_id: nct_id.to_string(),
            success: false,
            text: None,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
pub trait Enricher: Send + Sync {
    /// Fetch supplementary text for one study. Single attempt.
    async fn scrape(&self, nct_id: &str) -> Result<String, EnrichmentError>;

    async fn enrich(&self, nct_id: &str) -> EnrichmentOutcome {
        match self.scrape(nct_id).await {
            Ok(text) => {
                debug!(nct_id, chars = text.len(), "enrichment succeeded");
                EnrichmentOutcome::succeeded(nct_id, text)
            }
            Err(err) => {
                warn!(nct_id, error = %err, "enrichment failed");
                EnrichmentOutcome::failed(nct_id, err)
            }
        }
    }
}

/// Enrich `nct_ids` in batches of `width` concurrent calls, pausing `delay`
/// between batches. Outcomes come back in input order; one failed call never
/// cancels its siblings.
pub async fn enrich_batch(
    enricher: &dyn Enricher,
    nct_ids: &[String],
    width: usize,
    delay: Duration,
) -> Vec<EnrichmentOutcome> {
    let mut outcomes = Vec::with_capacity(nct_ids.len());
    let batches: Vec<&[String]> = nct_ids.chunks(width.max(1)).collect();
    let batch_count = batches.len();

    for (index, batch) in batches.into_iter().enumerate() {
        let results = join_all(batch.iter().map(|id| enricher.enrich(id))).await;
        outcomes.extend(results);

        if index + 1 < batch_count && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    outcomes
}

#[derive(Debug, Serialize)]
struct ScrapeRequest<'a> {
    url: &'a str,
    formats: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ScrapeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapeData {
    #[serde(default)]
    markdown: Option<String>,
}

/// Scrapes the study page as markdown through the Firecrawl API.
#[derive(Debug, Clone)]
pub struct FirecrawlEnricher {
    http: HttpFetcher,
    api_url: String,
    api_key: String,
    study_page_base: String,
}

impl FirecrawlEnricher {
    pub fn new(
        http: HttpFetcher,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        study_page_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            study_page_base: study_page_base.into(),
        }
    }
}

#[async_trait]
impl Enricher for FirecrawlEnricher {
    async fn scrape(&self, nct_id: &str) -> Result<String, EnrichmentError> {
        let page_url = format!("{}/{}", self.study_page_base.trim_end_matches('/'), nct_id);
        let request = ScrapeRequest {
            url: &page_url,
            formats: ["markdown"],
        };
        let resp: ScrapeResponse = self
            .http
            .post_json(&self.api_url, Some(&self.api_key), &request)
            .await?;

        if !resp.success {
            return Err(EnrichmentError::Rejected(
                resp.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        resp.data
            .and_then(|d| d.markdown)
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .ok_or(EnrichmentError::Empty)
    }
}

/// Fetches the study page directly and keeps its visible text.
#[derive(Debug, Clone)]
pub struct StudyPageEnricher {
    http: HttpFetcher,
    study_page_base: String,
}

impl StudyPageEnricher {
    pub fn new(http: HttpFetcher, study_page_base: impl Into<String>) -> Self {
        Self {
            http,
            study_page_base: study_page_base.into(),
        }
    }
}

#[async_trait]
impl Enricher for StudyPageEnricher {
    async fn scrape(&self, nct_id: &str) -> Result<String, EnrichmentError> {
        let page_url = format!("{}/{}", self.study_page_base.trim_end_matches('/'), nct_id);
        let resp = self.http.get_bytes(&page_url).await?;
        let html = String::from_utf8_lossy(&resp.body);
        extract_page_text(&html).ok_or(EnrichmentError::Empty)
    }
}

/// Visible text of `<main>` (or `<body>` when there is none), whitespace collapsed.
fn extract_page_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let root = ["main", "body"]
        .iter()
        .filter_map(|sel| Selector::parse(sel).ok())
        .find_map(|sel| document.select(&sel).next())?;

    let skip = Selector::parse("script, style, noscript").ok();
    let skipped: Vec<_> = skip
        .as_ref()
        .map(|sel| root.select(sel).map(|el| el.id()).collect())
        .unwrap_or_default();

    let mut words = Vec::new();
    for node in root.descendants() {
        if node.ancestors().any(|a| skipped.contains(&a.id())) {
            continue;
        }
        if let Some(text) = node.value().as_text() {
            words.extend(text.split_whitespace().map(str::to_string));
        }
    }

    let text = words.join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use ctsync_storage::HttpClientConfig;
    use serde_json::json;
    use tokio::time::Instant;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    /// Fails for identifiers containing "bad"; tracks peak concurrency.
    struct FlakyEnricher {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Enricher for FlakyEnricher {
        async fn scrape(&self, nct_id: &str) -> Result<String, EnrichmentError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if nct_id.contains("bad") {
                Err(EnrichmentError::Rejected("blocked".into()))
            } else {
                Ok(format!("text for {nct_id}"))
            }
        }
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_bounds_width() {
        let enricher = FlakyEnricher {
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        };
        let ids: Vec<String> = ["NCT1", "NCT-bad", "NCT3", "NCT4", "NCT5"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let started = Instant::now();
        let outcomes = enrich_batch(&enricher, &ids, 2, Duration::from_millis(20)).await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(
            outcomes.iter().map(|o| o.nct_id.as_str()).collect::<Vec<_>>(),
            vec!["NCT1", "NCT-bad", "NCT3", "NCT4", "NCT5"]
        );
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].text.is_none());
        assert_eq!(outcomes[1].error.as_deref(), Some("scrape rejected: blocked"));
        assert!(outcomes[2].success);
        assert!(enricher.peak.load(Ordering::SeqCst) <= 2);
        // three batches, two pauses
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn firecrawl_returns_markdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/scrape"))
            .and(header("authorization", "Bearer fc-key"))
            .and(body_partial_json(json!({
                "url": "https://clinicaltrials.gov/study/NCT01",
                "formats": ["markdown"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"markdown": "# Study page\n\nDetails", "metadata": {}}
            })))
            .mount(&server)
            .await;

        let enricher = FirecrawlEnricher::new(
            http(),
            format!("{}/v1/scrape", server.uri()),
            "fc-key",
            "https://clinicaltrials.gov/study",
        );
        let outcome = enricher.enrich("NCT01").await;
        assert!(outcome.success);
        assert_eq!(outcome.text.as_deref(), Some("# Study page\n\nDetails"));
    }

    #[tokio::test]
    async fn firecrawl_failure_becomes_failed_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/scrape"))
            .respond_with(ResponseTemplate::new(402))
            .mount(&server)
            .await;

        let enricher = FirecrawlEnricher::new(
            http(),
            format!("{}/v1/scrape", server.uri()),
            "fc-key",
            "https://clinicaltrials.gov/study",
        );
        let outcome = enricher.enrich("NCT01").await;
        assert!(!outcome.success);
        assert!(outcome.text.is_none());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn study_page_text_is_extracted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/study/NCT02"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><nav>menu</nav><main><h1>Trial  NCT02</h1>\
                 <script>var x = 1;</script><p>Eligibility\n details</p></main></body></html>",
            ))
            .mount(&server)
            .await;

        let enricher = StudyPageEnricher::new(http(), format!("{}/study", server.uri()));
        let text = enricher.scrape("NCT02").await.unwrap();
        assert_eq!(text, "Trial NCT02 Eligibility details");
    }

    #[test]
    fn empty_page_yields_nothing() {
        assert_eq!(extract_page_text("<html><body>   </body></html>"), None);
    }
}
