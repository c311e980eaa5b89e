//! Linkding REST client.
//!
//! The processor only sees [`BookmarkService`]; [`LinkdingClient`] is the
//! production implementation over `/api/bookmarks/`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::retry::Transient;

const PAGE_SIZE: usize = 100;

/// A bookmark as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Bookmark {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tag_names: Vec<String>,
}

/// Fields sent when creating or overwriting a bookmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewBookmark {
    pub url: String,
    pub title: String,
    pub description: String,
    pub tag_names: Vec<String>,
    pub is_archived: bool,
    pub unread: bool,
    pub shared: bool,
}

impl NewBookmark {
    pub fn new(url: &str, title: &str, description: &str, tags: &[String]) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            tag_names: tags.to_vec(),
            is_archived: false,
            unread: false,
            shared: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkdingError {
    /// Base URL is not an absolute http(s) URL
    #[error("invalid Linkding URL '{0}'")]
    InvalidUrl(String),
    #[error("failed to build Linkding client: {0}")]
    Build(String),
    /// Request exceeded the configured timeout
    #[error("Linkding request timed out")]
    Timeout,
    /// Connection-level failure
    #[error("Linkding request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// Non-2xx response
    #[error("Linkding API returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    /// Response body did not match the expected JSON shape
    #[error("unexpected Linkding response: {0}")]
    Decode(String),
    /// No Linkding URL/token was supplied
    #[error("Linkding is not configured")]
    NotConfigured,
}

impl Transient for LinkdingError {
    fn is_transient(&self) -> bool {
        match self {
            LinkdingError::Timeout | LinkdingError::Network(_) => true,
            LinkdingError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            LinkdingError::InvalidUrl(_)
            | LinkdingError::Build(_)
            | LinkdingError::Decode(_)
            | LinkdingError::NotConfigured => false,
        }
    }
}

/// Operations the processor needs from the bookmarking service.
#[async_trait]
pub trait BookmarkService: Send + Sync {
    /// All bookmarks carrying every tag in `tags` (case-insensitive).
    /// An empty filter returns everything.
    async fn fetch_bookmarks(&self, tags: &[String]) -> Result<Vec<Bookmark>, LinkdingError>;

    /// The bookmark stored for exactly `url`, if any.
    async fn get_bookmark_by_url(&self, url: &str) -> Result<Option<Bookmark>, LinkdingError>;

    async fn create_bookmark(&self, bookmark: &NewBookmark) -> Result<Bookmark, LinkdingError>;

    async fn update_bookmark(&self, id: u64, bookmark: &NewBookmark) -> Result<(), LinkdingError>;
}

#[derive(Deserialize)]
struct BookmarkPage {
    #[serde(default)]
    next: Option<String>,
    results: Vec<Bookmark>,
}

#[derive(Deserialize)]
struct CheckResponse {
    bookmark: Option<Bookmark>,
}

/// HTTP client for a Linkding instance.
#[derive(Debug, Clone)]
pub struct LinkdingClient {
    client: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl LinkdingClient {
    /// # Errors
    ///
    /// [`LinkdingError::InvalidUrl`] when `base_url` is not http(s);
    /// [`LinkdingError::Build`] when the TLS backend cannot initialise.
    pub fn new(base_url: &str, token: SecretString, timeout: Duration) -> Result<Self, LinkdingError> {
        let mut base = Url::parse(base_url.trim())
            .map_err(|_| LinkdingError::InvalidUrl(base_url.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(LinkdingError::InvalidUrl(base_url.to_string()));
        }
        // Url::join replaces the last path segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LinkdingError::Build(e.to_string()))?;

        tracing::debug!(url = %base, timeout = ?timeout, "Created Linkding API client");

        Ok(Self {
            client,
            base_url: base,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, LinkdingError> {
        self.base_url
            .join(path)
            .map_err(|_| LinkdingError::InvalidUrl(format!("{}{}", self.base_url, path)))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(
                header::AUTHORIZATION,
                format!("Token {}", self.token.expose_secret()),
            )
            .header(header::ACCEPT, "application/json")
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, LinkdingError> {
        let response = self.authorized(request).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkdingError::HttpStatus {
                status: status.as_u16(),
                body: crate::util::content_preview(&body, 200),
            });
        }
        Ok(response)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, LinkdingError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| LinkdingError::Decode(e.to_string()))
    }
}

fn classify(err: reqwest::Error) -> LinkdingError {
    if err.is_timeout() {
        LinkdingError::Timeout
    } else {
        LinkdingError::Network(err)
    }
}

/// Stand-in for runs without Linkding credentials (an import dry run).
/// Every call fails with [`LinkdingError::NotConfigured`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineService;

#[async_trait]
impl BookmarkService for OfflineService {
    async fn fetch_bookmarks(&self, _tags: &[String]) -> Result<Vec<Bookmark>, LinkdingError> {
        Err(LinkdingError::NotConfigured)
    }

    async fn get_bookmark_by_url(&self, _url: &str) -> Result<Option<Bookmark>, LinkdingError> {
        Err(LinkdingError::NotConfigured)
    }

    async fn create_bookmark(&self, _bookmark: &NewBookmark) -> Result<Bookmark, LinkdingError> {
        Err(LinkdingError::NotConfigured)
    }

    async fn update_bookmark(&self, _id: u64, _bookmark: &NewBookmark) -> Result<(), LinkdingError> {
        Err(LinkdingError::NotConfigured)
    }
}

/// True when `bookmark` carries every tag in `required`, ignoring case.
pub fn matches_tags(bookmark: &Bookmark, required: &[String]) -> bool {
    required.iter().all(|wanted| {
        let wanted = wanted.to_lowercase();
        bookmark
            .tag_names
            .iter()
            .any(|tag| tag.to_lowercase() == wanted)
    })
}

#[async_trait]
impl BookmarkService for LinkdingClient {
    async fn fetch_bookmarks(&self, tags: &[String]) -> Result<Vec<Bookmark>, LinkdingError> {
        tracing::info!(tags = ?tags, "Fetching bookmarks from Linkding API");

        let mut next = Some(self.endpoint(&format!("api/bookmarks/?limit={}&offset=0", PAGE_SIZE))?);
        let mut fetched = Vec::new();

        while let Some(url) = next.take() {
            let page: BookmarkPage = self.send_json(self.client.get(url.clone())).await?;
            fetched.extend(page.results);

            next = match page.next {
                Some(raw) => {
                    let parsed = Url::parse(&raw).map_err(|e| LinkdingError::Decode(e.to_string()))?;
                    // A server echoing the same page would loop forever
                    (parsed != url).then_some(parsed)
                }
                None => None,
            };
        }

        let total_fetched = fetched.len();
        let filtered: Vec<Bookmark> = fetched
            .into_iter()
            .filter(|b| matches_tags(b, tags))
            .collect();

        tracing::info!(
            total_fetched = total_fetched,
            after_filter = filtered.len(),
            filter_tags = ?tags,
            "Fetched and filtered bookmarks"
        );
        Ok(filtered)
    }

    async fn get_bookmark_by_url(&self, url: &str) -> Result<Option<Bookmark>, LinkdingError> {
        let mut endpoint = self.endpoint("api/bookmarks/check/")?;
        endpoint.query_pairs_mut().append_pair("url", url);

        let check: CheckResponse = self.send_json(self.client.get(endpoint)).await?;
        tracing::debug!(url = %url, found = check.bookmark.is_some(), "Checked for existing bookmark");
        Ok(check.bookmark)
    }

    async fn create_bookmark(&self, bookmark: &NewBookmark) -> Result<Bookmark, LinkdingError> {
        tracing::debug!(url = %bookmark.url, title = %bookmark.title, tags = ?bookmark.tag_names, "Creating bookmark in Linkding");
        let endpoint = self.endpoint("api/bookmarks/")?;
        self.send_json(self.client.post(endpoint).json(bookmark)).await
    }

    async fn update_bookmark(&self, id: u64, bookmark: &NewBookmark) -> Result<(), LinkdingError> {
        tracing::debug!(id = id, url = %bookmark.url, "Updating bookmark in Linkding");
        let endpoint = self.endpoint(&format!("api/bookmarks/{}/", id))?;
        self.send(self.client.put(endpoint).json(bookmark)).await?;
        Ok(())
    }
}
