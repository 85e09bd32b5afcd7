//! Outbound I/O for the export: the metrics API client and the table backends.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cwv_core::RequestDescriptor;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use url::Url;

pub mod table;

pub use table::{MemoryTableStore, TableStore, Workbook, WorkbookStore};

pub const CRATE_NAME: &str = "cwv-storage";

pub const DEFAULT_ENDPOINT: &str =
    "https://chromeuxreport.googleapis.com/v1/records:queryRecord?alt=json";

/// Unclassified HTTP exchange result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Why a single request produced no usable payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("reading body of status {status} response: {message}")]
    Body { status: u16, message: String },
    #[error("invalid JSON response: {0}")]
    Parse(String),
}

impl RequestFailure {
    /// Status code recorded in the audit trail; `None` when no response arrived.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            RequestFailure::Transport(_) => None,
            RequestFailure::HttpStatus { status, .. } | RequestFailure::Body { status, .. } => Some(*status),
            RequestFailure::Parse(_) => Some(StatusCode::OK.as_u16()),
        }
    }
}

/// Turn a raw exchange into a parsed payload, or the reason it is unusable.
pub fn classify_response(raw: RawResponse) -> Result<JsonValue, RequestFailure> {
    if raw.status != StatusCode::OK.as_u16() {
        return Err(RequestFailure::HttpStatus {
            status: raw.status,
            body: raw.body,
        });
    }
    serde_json::from_str(&raw.body).map_err(|err| RequestFailure::Parse(err.to_string()))
}

#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Issue exactly one request. Transport failures come back as
    /// [`RequestFailure::Transport`]; any HTTP response is returned raw.
    async fn query_record(&self, descriptor: &RequestDescriptor) -> Result<RawResponse, RequestFailure>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// reqwest-backed client for the Chrome UX Report `queryRecord` endpoint.
#[derive(Debug)]
pub struct CruxHttpClient {
    client: reqwest::Client,
    target: Url,
}

impl CruxHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let target = request_url(&config.endpoint, &config.api_key)?;
        Ok(Self { client, target })
    }
}

/// Endpoint with the credential appended as the `key` query parameter.
pub fn request_url(endpoint: &str, api_key: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(endpoint).with_context(|| format!("parsing endpoint {endpoint}"))?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

#[async_trait]
impl MetricsClient for CruxHttpClient {
    async fn query_record(&self, descriptor: &RequestDescriptor) -> Result<RawResponse, RequestFailure> {
        let span = info_span!(
            "crux_query",
            url = %descriptor.url,
            form_factor = %descriptor.form_factor
        );

        async {
            let resp = self
                .client
                .post(self.target.clone())
                .json(descriptor)
                .send()
                .await
                .map_err(|err| RequestFailure::Transport(err.to_string()))?;

            let status = resp.status().as_u16();
            let body = resp.text().await.map_err(|err| RequestFailure::Body {
                status,
                message: err.to_string(),
            })?;
            debug!(status, bytes = body.len(), "received response");
            Ok::<_, RequestFailure>(RawResponse { status, body })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_200_is_http_status_failure_with_body() {
        let err = classify_response(RawResponse {
            status: 500,
            body: "backend error".into(),
        })
        .unwrap_err();
        assert_eq!(
            err,
            RequestFailure::HttpStatus {
                status: 500,
                body: "backend error".into()
            }
        );
        assert_eq!(err.response_code(), Some(500));
    }

    #[test]
    fn garbled_200_is_parse_failure() {
        let err = classify_response(RawResponse {
            status: 200,
            body: "<html>".into(),
        })
        .unwrap_err();
        assert!(matches!(err, RequestFailure::Parse(_)));
        assert_eq!(err.response_code(), Some(200));
    }

    #[test]
    fn transport_failure_has_no_response_code() {
        assert_eq!(RequestFailure::Transport("timed out".into()).response_code(), None);
    }

    #[test]
    fn well_formed_200_parses() {
        let value = classify_response(RawResponse {
            status: 200,
            body: r#"{"record":{}}"#.into(),
        })
        .unwrap();
        assert!(value.get("record").is_some());
    }

    #[test]
    fn request_url_keeps_existing_query_and_appends_key() {
        let url = request_url(DEFAULT_ENDPOINT, "secret").unwrap();
        assert_eq!(url.path(), "/v1/records:queryRecord");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("alt".to_string(), "json".to_string()),
                ("key".to_string(), "secret".to_string())
            ]
        );
    }

    #[test]
    fn request_url_rejects_relative_endpoint() {
        assert!(request_url("/v1/records", "k").is_err());
    }
}
