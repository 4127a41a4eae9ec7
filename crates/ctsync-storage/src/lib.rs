//! Document persistence + HTTP fetch utilities for ctsync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

mod postgres;
mod store;

pub use postgres::{connect_pool, run_migrations, PgCollection, CRAWL_INDEX_TABLE, TRIALS_TABLE};
pub use store::{
    Collection, Condition, Document, Filter, Keyed, MemoryCollection, SortOrder, SortSpec,
    StoreError, Stored, UpsertSummary,
};

pub const CRATE_NAME: &str = "ctsync-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client is shutting down")]
    Shutdown,
}

/// Shared HTTP client. Every call is a single attempt bounded by the
/// configured timeout; callers decide whether to try again.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(url, self.client.get(url)).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let resp = self.send(url, self.client.get(url).query(query)).await?;
        decode_json(&resp)
    }

    pub async fn post_json<B, T>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &B,
    ) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        let resp = self.send(url, request).await?;
        decode_json(&resp)
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;

        let span = info_span!("http_fetch", url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn decode_json<T: DeserializeOwned>(resp: &FetchedResponse) -> Result<T, FetchError> {
    serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
        url: resp.final_url.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("ctsync-test".into()),
            global_concurrency: 2,
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn get_json_sends_query_and_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("q", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"n": 3})))
            .expect(1)
            .mount(&server)
            .await;

        let value: serde_json::Value = fetcher()
            .get_json(&format!("{}/items", server.uri()), &[("q", "abc".to_string())])
            .await
            .expect("json");
        assert_eq!(value["n"], 3);
    }

    #[tokio::test]
    async fn non_success_status_is_a_single_attempt_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher()
            .get_bytes(&format!("{}/down", server.uri()))
            .await
            .expect_err("503 must fail");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn post_json_attaches_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scrape"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let value: serde_json::Value = fetcher()
            .post_json(
                &format!("{}/scrape", server.uri()),
                Some("secret"),
                &serde_json::json!({"url": "x"}),
            )
            .await
            .expect("post");
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn undecodable_body_is_reported_with_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = fetcher()
            .get_json::<serde_json::Value>(&format!("{}/garbage", server.uri()), &[])
            .await
            .expect_err("decode must fail");
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
