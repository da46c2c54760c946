use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound request the server performs on a client's behalf.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

/// What came back from the remote resource.
#[derive(Clone, Debug)]
pub struct FetchResponse {
    /// Final URL, after any redirects.
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid outbound header {0}")]
    Header(String),
}

/// The collaborator that executes the real HTTP request. Seam for tests and
/// alternative transports; the server only needs this contract.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// `reqwest`-backed fetcher. Redirects are followed; the response reports
/// the final URL.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("burrow/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::Header(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| FetchError::Header(name.to_string()))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let url = response.url().to_string();
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(FetchResponse {
            url,
            status,
            headers,
            body,
        })
    }
}
