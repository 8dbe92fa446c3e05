//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests made by workers and discovery:
//! - Building HTTP clients with an identifying user agent string
//! - GET requests returning the raw body
//! - Classification of failures into transient and permanent

use crate::config::UserAgentConfig;
use crate::state::FailureKind;
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use std::time::Duration;
use thiserror::Error;

/// Maximum number of redirects followed for one request
const MAX_REDIRECTS: usize = 10;

/// A successfully fetched resource
#[derive(Debug, Clone)]
pub struct FetchedContent {
    /// Final URL after redirects
    pub final_url: String,

    pub status_code: u16,

    /// Content-Type header value
    pub content_type: Option<String>,

    pub body: Vec<u8>,
}

impl FetchedContent {
    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors that can occur while fetching a resource
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Failure classification used by the retry policy
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Http { status, .. } => classify_status(*status),
            Self::InvalidUrl(_) => FailureKind::Permanent,
            Self::Timeout(_) | Self::Connect(_) | Self::Network(_) => FailureKind::Transient,
        }
    }

    fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(url.to_string())
        } else if error.is_connect() {
            Self::Connect(format!("{}: {}", url, error))
        } else if error.is_builder() {
            Self::InvalidUrl(format!("{}: {}", url, error))
        } else {
            Self::Network(format!("{}: {}", url, error))
        }
    }
}

/// Classifies an HTTP error status
///
/// | Status | Kind |
/// |--------|------|
/// | 408, 429 | Transient |
/// | other 4xx | Permanent |
/// | 5xx and anything else | Transient |
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 429 => FailureKind::Transient,
        400..=499 => FailureKind::Permanent,
        _ => FailureKind::Transient,
    }
}

/// Retrieves the raw content of a resource
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
/// * `timeout` - Total time allowed for one request
///
/// # Example
///
/// ```no_run
/// use chamber_sync::config::UserAgentConfig;
/// use chamber_sync::crawler::build_http_client;
/// use std::time::Duration;
///
/// let config = UserAgentConfig {
///     crawler_name: "ChamberSync".to_string(),
///     crawler_version: "0.3".to_string(),
///     contact_url: "https://example.org/about".to_string(),
///     contact_email: "data@example.org".to_string(),
/// };
///
/// let client = build_http_client(&config, Duration::from_secs(30)).unwrap();
/// ```
pub fn build_http_client(
    config: &UserAgentConfig,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// reqwest-backed fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &UserAgentConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config, timeout)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status();
        let final_url = response.url().to_string();

        if !status.is_success() {
            return Err(FetchError::Http {
                url: final_url,
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        tracing::debug!("Fetched {} ({} bytes)", final_url, body.len());

        Ok(FetchedContent {
            final_url,
            status_code: status.as_u16(),
            content_type,
            body: body.to_vec(),
        })
    }
}
