//! Online enrichment: AI generated insights for the top detected category.
//!
//! This module holds the wire side only: the lookup key, the GraphQL codec and
//! the host transport that carries out `crux_http` requests. Which keys get
//! fetched, and when, is decided by the core in [`crate::app`].

use async_trait::async_trait;
use crux_http::protocol::{HttpRequest, HttpResponse, HttpResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::analysis::{category_label, content_hash};
use crate::vision::Detection;

pub const MAX_RESPONSE_BODY_SIZE: usize = 1024 * 1024;

pub const AI_INSIGHTS_QUERY: &str = "query AIInsights($input: AIInsightsInput!) {
  AIInsights(input: $input) {
    extra_facts
    simplified_summary
    motivation_text
  }
}";

/// Identity of one enrichment lookup. A user hint is part of the identity,
/// so the same scene with a different hint is fetched again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrichmentKey {
    pub category: String,
    pub result_hash: String,
    pub user_text: Option<String>,
}

impl EnrichmentKey {
    pub fn new(category: impl Into<String>, result_hash: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            result_hash: result_hash.into(),
            user_text: None,
        }
    }

    /// Key for a detection set, `None` when there is nothing to enrich.
    pub fn for_detections(detections: &[Detection]) -> Option<Self> {
        let top = detections.iter().fold(None::<&Detection>, |best, d| match best {
            Some(b) if b.confidence >= d.confidence => Some(b),
            _ => Some(d),
        })?;
        Some(Self::new(category_label(top.class_id), content_hash(detections)))
    }

    /// Blank hints are dropped.
    #[must_use]
    pub fn with_user_text(mut self, text: Option<&str>) -> Self {
        self.user_text = normalize_user_text(text);
        self
    }
}

pub(crate) fn normalize_user_text(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AiInsights {
    pub extra_facts: Vec<String>,
    pub simplified_summary: String,
    pub motivation_text: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnrichmentError {
    #[error("invalid enrichment endpoint: {reason}")]
    InvalidEndpoint { reason: String },

    #[error("enrichment timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("HTTP error {status}")]
    HttpStatus { status: u16 },

    #[error("response body too large: {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("graphql errors: {}", messages.join("; "))]
    GraphQl { messages: Vec<String> },

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },
}

impl EnrichmentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichmentError::Timeout { .. } | EnrichmentError::Transport { .. } => true,
            EnrichmentError::HttpStatus { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Parses an endpoint and accepts only `http` and `https`.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, EnrichmentError> {
    let url = Url::parse(endpoint).map_err(|e| EnrichmentError::InvalidEndpoint {
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(EnrichmentError::InvalidEndpoint {
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}

// ============================================================================
// GraphQL codec
// ============================================================================

pub fn encode_request(key: &EnrichmentKey) -> Result<Vec<u8>, EnrichmentError> {
    let mut input = json!({
        "category": key.category,
        "resultHash": key.result_hash,
    });
    if let Some(text) = &key.user_text {
        input["userText"] = json!(text);
    }
    let body = json!({
        "operationName": "AIInsights",
        "query": AI_INSIGHTS_QUERY,
        "variables": { "input": input }
    });
    serde_json::to_vec(&body).map_err(|e| EnrichmentError::MalformedResponse {
        reason: e.to_string(),
    })
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Vec<GraphQlErrorEntry>,
}

#[derive(Deserialize)]
struct GraphQlData {
    #[serde(rename = "AIInsights")]
    ai_insights: Option<AiInsights>,
}

#[derive(Deserialize)]
struct GraphQlErrorEntry {
    message: String,
}

pub fn decode_response(body: &[u8]) -> Result<AiInsights, EnrichmentError> {
    if body.len() > MAX_RESPONSE_BODY_SIZE {
        return Err(EnrichmentError::ResponseTooLarge {
            size: body.len(),
            max: MAX_RESPONSE_BODY_SIZE,
        });
    }

    let response: GraphQlResponse =
        serde_json::from_slice(body).map_err(|e| EnrichmentError::MalformedResponse {
            reason: e.to_string(),
        })?;

    if !response.errors.is_empty() {
        return Err(EnrichmentError::GraphQl {
            messages: response.errors.into_iter().map(|e| e.message).collect(),
        });
    }

    response
        .data
        .and_then(|d| d.ai_insights)
        .ok_or_else(|| EnrichmentError::MalformedResponse {
            reason: "missing data.AIInsights".to_string(),
        })
}

/// Status check followed by [`decode_response`].
pub fn insights_from_reply(status: u16, body: &[u8]) -> Result<AiInsights, EnrichmentError> {
    if !(200..300).contains(&status) {
        return Err(EnrichmentError::HttpStatus { status });
    }
    decode_response(body)
}

// ============================================================================
// Host transport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Carries out the HTTP requests the core asks for.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, EnrichmentError>;
}

/// Converts a transport reply into what the `Http` capability resolves with.
pub fn to_http_result(reply: Result<TransportResponse, EnrichmentError>) -> HttpResult {
    match reply {
        Ok(response) => HttpResult::Ok(
            HttpResponse::status(response.status)
                .body(response.body)
                .build(),
        ),
        Err(e) => HttpResult::Err(crux_http::Error::Io(e.to_string())),
    }
}

#[cfg(feature = "http-client")]
pub use reqwest_transport::ReqwestTransport;

#[cfg(feature = "http-client")]
mod reqwest_transport {
    use std::time::Duration;

    use async_trait::async_trait;
    use crux_http::protocol::HttpRequest;
    use tracing::{debug, instrument};

    use super::{EnrichmentError, HttpTransport, TransportResponse, MAX_RESPONSE_BODY_SIZE};

    /// [`HttpTransport`] for hosts that run the core in a Rust process.
    pub struct ReqwestTransport {
        client: reqwest::Client,
        timeout: Duration,
    }

    impl ReqwestTransport {
        pub fn new(timeout: Duration) -> Result<Self, EnrichmentError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| EnrichmentError::Transport {
                    reason: e.to_string(),
                })?;
            Ok(Self { client, timeout })
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
        async fn execute(
            &self,
            request: &HttpRequest,
        ) -> Result<TransportResponse, EnrichmentError> {
            let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
                EnrichmentError::Transport {
                    reason: e.to_string(),
                }
            })?;

            let mut builder = self.client.request(method, &request.url);
            for header in &request.headers {
                builder = builder.header(&header.name, &header.value);
            }

            let response = builder
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| self.map_error(&e))?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| self.map_error(&e))?;

            if body.len() > MAX_RESPONSE_BODY_SIZE {
                return Err(EnrichmentError::ResponseTooLarge {
                    size: body.len(),
                    max: MAX_RESPONSE_BODY_SIZE,
                });
            }

            debug!(status, size = body.len(), "enrichment response");
            Ok(TransportResponse {
                status,
                body: body.to_vec(),
            })
        }
    }

    impl ReqwestTransport {
        fn map_error(&self, e: &reqwest::Error) -> EnrichmentError {
            if e.is_timeout() {
                EnrichmentError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                EnrichmentError::Transport {
                    reason: e.to_string(),
                }
            }
        }
    }
}
