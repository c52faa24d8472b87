//! Thin REST client for the index engine cluster

use crate::error::{Error, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Request body variants accepted by the engine
#[derive(Debug, Clone)]
pub enum Payload {
    Json(Value),
    /// Pre-rendered JSON text (index settings templates)
    RawJson(String),
    /// Newline-delimited bulk body
    NdJson(String),
}

impl Payload {
    fn content_type(&self) -> &'static str {
        match self {
            Payload::Json(_) | Payload::RawJson(_) => "application/json",
            Payload::NdJson(_) => "application/x-ndjson",
        }
    }

    fn into_body(self) -> Result<String> {
        match self {
            Payload::Json(v) => Ok(serde_json::to_string(&v)?),
            Payload::RawJson(s) | Payload::NdJson(s) => Ok(s),
        }
    }
}

/// Status and full body text of one engine response
#[derive(Debug, Clone)]
pub struct EsResponse {
    pub status: StatusCode,
    pub body: String,
}

impl EsResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Fail with `context` unless the status is 2xx
    pub fn error_for_status(self, context: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.into_error(context))
        }
    }

    pub fn into_error(self, context: &str) -> Error {
        Error::IndexEngine(format!("{}: [{}] {}", context, self.status, self.body))
    }
}

/// Client over a comma-separated list of cluster nodes.
///
/// Requests rotate over the nodes. A transport error moves on to the next
/// node; statuses listed in `retry_on` are retried up to `max_retries`
/// times with a linear backoff.
pub struct EsClient {
    client: Client,
    nodes: Vec<Url>,
    next: AtomicUsize,
    api_key: Option<HeaderValue>,
    max_retries: usize,
    retry_on: &'static [StatusCode],
}

pub const RETRY_ON_STATUS: [StatusCode; 4] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

impl EsClient {
    pub fn new(cluster: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let nodes = parse_nodes(cluster)?;
        let client = Client::builder().timeout(timeout).gzip(true).build()?;
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .map(|k| {
                HeaderValue::from_str(&format!("ApiKey {}", k))
                    .map_err(|e| Error::Config(format!("Invalid es_api_key: {}", e)))
            })
            .transpose()?;
        Ok(Self {
            client,
            nodes,
            next: AtomicUsize::new(0),
            api_key,
            max_retries: 0,
            retry_on: &[],
        })
    }

    /// Retry the given statuses up to `max_retries` extra attempts
    pub fn with_retries(mut self, max_retries: usize, retry_on: &'static [StatusCode]) -> Self {
        self.max_retries = max_retries;
        self.retry_on = retry_on;
        self
    }

    fn node(&self) -> &Url {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        &self.nodes[i]
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.node()
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("Invalid index engine URL: {}", e)))
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        payload: Option<Payload>,
    ) -> Result<EsResponse> {
        let body = match payload {
            Some(p) => Some((p.content_type(), p.into_body()?)),
            None => None,
        };

        let attempts = self.max_retries.max(self.nodes.len().saturating_sub(1)) + 1;
        let mut last_err: Option<Error> = None;
        for attempt in 0..attempts {
            let url = self.endpoint(path)?;
            debug!("{} {}", method, url);
            let mut request = self.client.request(method.clone(), url);
            if let Some(key) = &self.api_key {
                request = request.header(AUTHORIZATION, key.clone());
            }
            if let Some((content_type, body)) = &body {
                request = request.header(CONTENT_TYPE, *content_type).body(body.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await?;
                    if self.retry_on.contains(&status) && attempt < self.max_retries {
                        warn!("{} {} returned {}, retrying", method, path, status);
                        last_err = Some(Error::IndexEngine(format!("[{}] {}", status, text)));
                    } else {
                        return Ok(EsResponse { status, body: text });
                    }
                }
                Err(e) => {
                    warn!("{} {} failed: {}", method, path, e);
                    last_err = Some(Error::Http(e));
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
            }
        }

        Err(last_err.unwrap_or_else(|| Error::IndexEngine(format!("{} {} failed", method, path))))
    }

    pub async fn get(&self, path: &str) -> Result<EsResponse> {
        self.send(Method::GET, path, None).await
    }

    pub async fn head(&self, path: &str) -> Result<EsResponse> {
        self.send(Method::HEAD, path, None).await
    }

    pub async fn put(&self, path: &str, payload: Option<Payload>) -> Result<EsResponse> {
        self.send(Method::PUT, path, payload).await
    }

    pub async fn post(&self, path: &str, payload: Payload) -> Result<EsResponse> {
        self.send(Method::POST, path, Some(payload)).await
    }

    pub async fn delete(&self, path: &str) -> Result<EsResponse> {
        self.send(Method::DELETE, path, None).await
    }
}

/// Split `http://a:9200,http://b:9200` into base URLs ending in `/`
pub fn parse_nodes(cluster: &str) -> Result<Vec<Url>> {
    let nodes = cluster
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let base = if s.ends_with('/') { s.to_string() } else { format!("{}/", s) };
            Url::parse(&base)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if nodes.is_empty() {
        return Err(Error::Config("require es cluster addr".to_string()));
    }
    Ok(nodes)
}
