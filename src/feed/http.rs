use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use std::time::Duration;
use thiserror::Error;

use crate::retry::Transient;

const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Settings for the page/feed fetching client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout (connect + body).
    pub timeout: Duration,
    /// Default User-Agent sent with every request.
    pub user_agent: String,
    /// Maximum number of redirects to follow before failing.
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (compatible; linkding-to-opml/1.0)".to_string(),
            max_redirects: 3,
        }
    }
}

/// Errors returned by [`HttpClient::fetch_page`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// The client could not be constructed (TLS backend, bad header value).
    #[error("failed to build HTTP client: {0}")]
    Build(String),
    /// Network-level error (DNS, connection refused, TLS, etc.)
    #[error("HTTP request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// Request exceeded the configured timeout
    #[error("request timed out")]
    Timeout,
    /// Redirect chain longer than the configured ceiling
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),
    /// Non-2xx response
    #[error("HTTP request failed with status {status}: {reason}")]
    HttpStatus { status: u16, reason: String },
    /// Response body exceeded the size limit
    #[error("response too large (exceeds {0} bytes)")]
    TooLarge(usize),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout => true,
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            FetchError::Build(_) | FetchError::TooManyRedirects(_) | FetchError::TooLarge(_) => {
                false
            }
        }
    }
}

/// HTTP client used for every page and feed fetch.
///
/// Cloning is cheap: the underlying `reqwest::Client` is reference counted,
/// so one instance is built per run and shared by all workers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    user_agent: String,
    max_redirects: usize,
}

impl HttpClient {
    /// Builds a client with the configured timeout and redirect ceiling.
    ///
    /// Gzip/deflate decoding is enabled at the client level: when a response
    /// carries `Content-Encoding: gzip` the body handed back is already
    /// decompressed.
    pub fn new(config: &HttpConfig) -> Result<Self, FetchError> {
        let max_redirects = config.max_redirects;
        let redirect_policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                tracing::debug!(
                    url = %attempt.url(),
                    redirect_count = attempt.previous().len(),
                    max_redirects = max_redirects,
                    "HTTP request exceeded maximum redirects"
                );
                attempt.error(format!("stopped after {} redirects", max_redirects))
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(redirect_policy)
            .default_headers(browser_headers())
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|e| FetchError::Build(e.to_string()))?;

        tracing::debug!(
            timeout = ?config.timeout,
            user_agent = %config.user_agent,
            max_redirects = config.max_redirects,
            "Created HTTP client for feed discovery"
        );

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            max_redirects,
        })
    }

    /// User-Agent configured for this client.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Fetches `url` and returns the (decompressed) body as text.
    ///
    /// No retries happen here; callers wrap this in [`crate::retry`] when the
    /// failure is transient.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Timeout`] when the request exceeds the configured timeout
    /// - [`FetchError::TooManyRedirects`] when the redirect ceiling is hit
    /// - [`FetchError::HttpStatus`] for any non-2xx response
    /// - [`FetchError::TooLarge`] for bodies over 10MB
    /// - [`FetchError::Network`] for everything else at the transport level
    pub async fn fetch_page(&self, url: &str, user_agent: &str) -> Result<String, FetchError> {
        tracing::debug!(url = %url, "Fetching web page");

        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %url, status_code = status.as_u16(), "HTTP request returned non-2xx status");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();

        let bytes = read_limited_bytes(response, MAX_BODY_SIZE)
            .await
            .map_err(|e| match e {
                FetchError::Network(inner) => self.classify(url, inner),
                other => other,
            })?;

        tracing::debug!(
            url = %url,
            status_code = status.as_u16(),
            body_size = bytes.len(),
            content_type = %content_type,
            "Successfully fetched web page"
        );

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            tracing::debug!(url = %url, "HTTP request timed out");
            FetchError::Timeout
        } else if err.is_redirect() {
            FetchError::TooManyRedirects(self.max_redirects)
        } else {
            tracing::debug!(url = %url, error = %err, "HTTP request failed");
            FetchError::Network(err)
        }
    }
}

/// Header set that makes requests look like an ordinary browser visit.
///
/// Some sites reject bare clients outright; these are the headers a desktop
/// browser sends on a top-level navigation.
fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.5"),
    );
    headers.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip, deflate"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::UPGRADE_INSECURE_REQUESTS,
        HeaderValue::from_static("1"),
    );
    headers
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Content-Length reflects the compressed size when the body is encoded,
    // so it only serves as an early reject.
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::TooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::TooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
