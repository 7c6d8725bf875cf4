//! HTTP client for Solr's select and update handlers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{Document, DocumentSink, DocumentSource, PageRequest};
use crate::error::ReindexError;
use crate::models::job_spec::CollectionRef;

const USER_AGENT: &str = concat!("solrex-reindex/", env!("CARGO_PKG_VERSION"));
const BODY_SNIPPET_CHARS: usize = 200;

/// Basic-auth credentials shared by every collection this process talks to.
#[derive(Clone)]
pub struct SolrCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SolrCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolrCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Failures talking to Solr, before classification.
#[derive(Debug, Error)]
pub enum SolrError {
    #[error("request to {url} failed: {details}")]
    Transport {
        url: String,
        details: String,
        retryable: bool,
    },
    #[error("HTTP {status} from {url}: {message}")]
    Http {
        url: String,
        status: u16,
        message: String,
    },
    #[error("Solr reported status {status}: {message}")]
    Solr { status: i64, message: String },
    #[error("malformed response from {url}: {details}")]
    MalformedResponse { url: String, details: String },
    #[error("client configuration error: {0}")]
    Configuration(String),
}

impl From<SolrError> for ReindexError {
    fn from(error: SolrError) -> Self {
        let message = error.to_string();
        match error {
            SolrError::Transport { retryable, .. } => {
                if retryable {
                    ReindexError::TransientCopy(message)
                } else {
                    ReindexError::FatalCopy(message)
                }
            }
            SolrError::Http { status, .. } => {
                if status == 408 || status == 429 || (500..600).contains(&status) {
                    ReindexError::TransientCopy(message)
                } else if status == 401 || status == 403 {
                    ReindexError::FatalCopy(format!("authorization failed: {}", message))
                } else {
                    ReindexError::FatalCopy(message)
                }
            }
            SolrError::Solr { .. }
            | SolrError::MalformedResponse { .. }
            | SolrError::Configuration(_) => ReindexError::FatalCopy(message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Deserialize)]
struct SelectBody {
    docs: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct SelectResponse {
    #[serde(rename = "responseHeader")]
    response_header: Option<ResponseHeader>,
    response: SelectBody,
}

#[derive(Debug, Deserialize)]
struct UniqueKeyResponse {
    #[serde(rename = "uniqueKey")]
    unique_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(rename = "responseHeader")]
    response_header: ResponseHeader,
}

/// reqwest-backed Solr client.
#[derive(Debug, Clone)]
pub struct SolrClient {
    http: reqwest::Client,
    credentials: Option<SolrCredentials>,
}

impl SolrClient {
    /// Client whose requests time out after `request_timeout`.
    pub fn new(
        credentials: Option<SolrCredentials>,
        request_timeout: Duration,
    ) -> Result<Self, SolrError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|err| SolrError::Configuration(err.to_string()))?;

        Ok(Self { http, credentials })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            None => request,
        }
    }

    fn handler_url(collection: &CollectionRef, handler: &str) -> Result<Url, SolrError> {
        Url::parse(&format!("{}/{}", collection.endpoint(), handler))
            .map_err(|err| SolrError::Configuration(format!("invalid collection URL: {}", err)))
    }

    async fn send(&self, url: &Url, request: RequestBuilder) -> Result<Response, SolrError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(status, &body);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!(url = %url, status = status.as_u16(), "Solr request failed, retryable");
        } else {
            warn!(url = %url, status = status.as_u16(), message = %message, "Solr request rejected");
        }

        Err(SolrError::Http {
            url: url.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DocumentSource for SolrClient {
    async fn fetch_page(
        &self,
        collection: &CollectionRef,
        request: &PageRequest,
    ) -> Result<Vec<Document>, ReindexError> {
        let mut url = Self::handler_url(collection, "select")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", &request.query)
                .append_pair("sort", &format!("{} asc", request.sort_field))
                .append_pair("rows", &request.rows.to_string())
                .append_pair("wt", "json");
            for fq in request.effective_filter_queries() {
                pairs.append_pair("fq", &fq);
            }
            if let Some(fields) = &request.fields {
                pairs.append_pair("fl", &fields.join(","));
            }
        }

        debug!(url = %url, rows = request.rows, "Fetching source page");

        let response = self.send(&url, self.http.get(url.clone())).await?;
        let page: SelectResponse = read_json(&url, response).await?;

        if let Some(header) = page.response_header
            && header.status != 0
        {
            return Err(SolrError::Solr {
                status: header.status,
                message: format!("select on {} failed", collection),
            }
            .into());
        }

        Ok(page.response.docs)
    }

    async fn unique_key(&self, collection: &CollectionRef) -> Result<Option<String>, ReindexError> {
        let mut url = Self::handler_url(collection, "schema/uniquekey")?;
        url.query_pairs_mut().append_pair("wt", "json");

        debug!(url = %url, "Looking up schema unique key");

        let response = self.send(&url, self.http.get(url.clone())).await?;
        let schema: UniqueKeyResponse = read_json(&url, response).await?;
        Ok(schema.unique_key)
    }
}

#[async_trait]
impl DocumentSink for SolrClient {
    async fn upsert_batch(
        &self,
        collection: &CollectionRef,
        documents: &[Document],
    ) -> Result<(), ReindexError> {
        if documents.is_empty() {
            return Ok(());
        }

        let mut url = Self::handler_url(collection, "update")?;
        url.query_pairs_mut()
            .append_pair("commit", "true")
            .append_pair("wt", "json");

        debug!(url = %url, documents = documents.len(), "Writing batch to target");

        let response = self
            .send(&url, self.http.post(url.clone()).json(documents))
            .await?;
        let update: UpdateResponse = read_json(&url, response).await?;

        if update.response_header.status != 0 {
            return Err(SolrError::Solr {
                status: update.response_header.status,
                message: format!("update on {} failed", collection),
            }
            .into());
        }

        Ok(())
    }
}

/// Read the whole body, then parse it. Losing the connection or timing out
/// mid-body is a transport failure; only a complete body that does not parse
/// is malformed.
async fn read_json<T: DeserializeOwned>(url: &Url, response: Response) -> Result<T, SolrError> {
    let body = response
        .bytes()
        .await
        .map_err(|err| body_read_error(url, err))?;
    parse_body(url, &body)
}

fn parse_body<T: DeserializeOwned>(url: &Url, body: &[u8]) -> Result<T, SolrError> {
    serde_json::from_slice(body).map_err(|err| SolrError::MalformedResponse {
        url: url.to_string(),
        details: err.to_string(),
    })
}

fn body_read_error(url: &Url, err: reqwest::Error) -> SolrError {
    SolrError::Transport {
        url: url.to_string(),
        details: format!("reading response body: {}", err),
        retryable: true,
    }
}

fn transport_error(url: &Url, err: reqwest::Error) -> SolrError {
    let retryable = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
    SolrError::Transport {
        url: url.to_string(),
        details: err.to_string(),
        retryable,
    }
}

/// Prefer Solr's `error.msg`; fall back to a truncated body.
fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .pointer("/error/msg")
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    match from_json {
        Some(message) => message,
        None if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        None if body.chars().count() > BODY_SNIPPET_CHARS => {
            let truncated: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
            format!("{}...", truncated)
        }
        None => body.to_string(),
    }
}
