use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use super::http::{FetchError, HttpClient};
use super::parser::parse_feed;
use crate::retry::Transient;
use crate::util::content_preview;

/// Conventional feed locations tried against the page's origin when the
/// markup advertises nothing.
pub const COMMON_FEED_PATHS: &[&str] = &[
    "/feed",
    "/feed.xml",
    "/rss",
    "/rss.xml",
    "/atom.xml",
    "/feeds/all.atom.xml",
    "/index.xml",
    "/.rss",
];

static FEED_LINK_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<link[^>]+rel[^>]*alternate[^>]+type[^>]*application/(rss|atom)\+xml[^>]+href[^>]*=["']([^"']+)["'][^>]*>"#,
    )
    .ok()
});

/// A feed found for a bookmarked page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFeed {
    /// Absolute URL of the feed document
    pub feed_url: String,
    /// Channel title from the parsed feed
    pub feed_title: String,
    /// The page discovery started from
    pub page_url: String,
}

/// Errors that can occur during forward discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The page URL could not be parsed
    #[error("invalid page URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// The page itself could not be fetched
    #[error("failed to fetch page: {0}")]
    Fetch(#[source] FetchError),
    /// Every candidate feed URL failed to fetch or parse
    #[error("found {tried} potential feed URLs but none were valid feeds")]
    NoValidFeed { tried: usize },
}

impl Transient for DiscoveryError {
    fn is_transient(&self) -> bool {
        match self {
            DiscoveryError::Fetch(e) => e.is_transient(),
            DiscoveryError::InvalidUrl { .. } | DiscoveryError::NoValidFeed { .. } => false,
        }
    }
}

/// Per-run discovery settings.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// User-Agent for page and feed fetches; the client default when empty.
    pub user_agent: String,
    /// When set, pages that yield no working feed are saved here.
    pub debug_dir: Option<PathBuf>,
}

/// Discovers the feed published by `page_url`.
///
/// Steps, first success wins:
/// 1. Fetch the page (failure is terminal; transient failures are the
///    caller's to retry).
/// 2. If the page body is itself a feed, use it.
/// 3. Collect candidates from `<link rel="alternate">` markup, falling back
///    to a regex scan, then to [`COMMON_FEED_PATHS`].
/// 4. Fetch and parse each candidate in order.
///
/// # Errors
///
/// - [`DiscoveryError::InvalidUrl`] if `page_url` is not an absolute URL
/// - [`DiscoveryError::Fetch`] if the page could not be retrieved
/// - [`DiscoveryError::NoValidFeed`] if no candidate fetched and parsed
pub async fn discover_feed(
    client: &HttpClient,
    page_url: &str,
    options: &DiscoveryOptions,
) -> Result<DiscoveredFeed, DiscoveryError> {
    let base = Url::parse(page_url).map_err(|e| DiscoveryError::InvalidUrl {
        url: page_url.to_string(),
        reason: e.to_string(),
    })?;
    let user_agent = if options.user_agent.is_empty() {
        client.user_agent()
    } else {
        options.user_agent.as_str()
    };

    tracing::debug!(url = %page_url, "Starting feed autodiscovery");

    let page = client.fetch_page(page_url, user_agent).await.map_err(|e| {
        tracing::warn!(url = %page_url, error = %e, "Feed discovery failed: could not fetch page");
        DiscoveryError::Fetch(e)
    })?;

    tracing::debug!(
        url = %page_url,
        page_size = page.len(),
        content_preview = %content_preview(&page, 200),
        "Fetched page for feed discovery"
    );

    if let Ok(feed) = parse_feed(page.as_bytes()) {
        tracing::info!(url = %page_url, feed_title = %feed.title, "Bookmarked URL is itself a feed");
        return Ok(DiscoveredFeed {
            feed_url: page_url.to_string(),
            feed_title: feed.title,
            page_url: page_url.to_string(),
        });
    }

    let candidates = candidate_feed_urls(&page, &base);

    for (i, feed_url) in candidates.iter().enumerate() {
        tracing::debug!(
            page_url = %page_url,
            feed_url = %feed_url,
            attempt = i + 1,
            total = candidates.len(),
            "Attempting to fetch feed"
        );

        let body = match client.fetch_page(feed_url, user_agent).await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(page_url = %page_url, feed_url = %feed_url, error = %e, "Candidate fetch failed, trying next");
                continue;
            }
        };

        match parse_feed(body.as_bytes()) {
            Ok(feed) => {
                tracing::info!(
                    page_url = %page_url,
                    feed_url = %feed_url,
                    feed_title = %feed.title,
                    attempt = i + 1,
                    "Feed discovery successful"
                );
                return Ok(DiscoveredFeed {
                    feed_url: feed_url.clone(),
                    feed_title: feed.title,
                    page_url: page_url.to_string(),
                });
            }
            Err(_) => {
                tracing::debug!(
                    page_url = %page_url,
                    feed_url = %feed_url,
                    feed_preview = %content_preview(&body, 200),
                    "Candidate is not a feed, trying next"
                );
            }
        }
    }

    if let Some(dir) = &options.debug_dir {
        if let Some(saved) = save_failed_page(dir, page_url, &page, "no_valid_feed") {
            tracing::debug!(page_url = %page_url, saved_html = %saved.display(), "Saved failed page for debugging");
        }
    }

    tracing::warn!(
        page_url = %page_url,
        attempted_feeds = candidates.len(),
        "Feed discovery failed: no valid feeds found among candidates"
    );

    Err(DiscoveryError::NoValidFeed {
        tried: candidates.len(),
    })
}

/// Ordered candidate list: markup links, else regex matches, else
/// conventional paths. Never empty for an http(s) base URL.
pub fn candidate_feed_urls(html: &str, base: &Url) -> Vec<String> {
    let found = find_feed_links(html, base);
    if !found.is_empty() {
        return found;
    }

    let found = find_feed_links_regex(html, base);
    if !found.is_empty() {
        tracing::info!(base_url = %base, regex_found = found.len(), "Regex fallback found feeds the markup scan missed");
        return found;
    }

    tracing::debug!(base_url = %base, "No advertised feeds, trying common feed paths");
    common_feed_paths(base)
}

/// Scans parsed markup for `<link>` elements that advertise a feed.
///
/// Matching is permissive: `rel` must contain "alternate", and either the
/// `type` names a feed/XML media type or the `href` looks like a feed path.
pub fn find_feed_links(html: &str, base: &Url) -> Vec<String> {
    let Ok(selector) = Selector::parse("link[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(html);

    document
        .select(&selector)
        .filter_map(|link| {
            let element = link.value();
            let rel = element.attr("rel").unwrap_or_default().to_lowercase();
            let kind = element.attr("type").unwrap_or_default().to_lowercase();
            let href = element.attr("href")?;

            if !rel.contains("alternate") {
                return None;
            }
            if !is_feed_type(&kind) && !has_feed_path(href) {
                tracing::debug!(rel = %rel, kind = %kind, href = %href, "Alternate link not recognized as feed");
                return None;
            }

            let resolved = resolve_url(href, base)?;
            tracing::debug!(base_url = %base, href = %href, resolved = %resolved, "Found feed link");
            Some(resolved)
        })
        .collect()
}

/// Regex scan for standard RSS/Atom autodiscovery links in raw markup.
pub fn find_feed_links_regex(html: &str, base: &Url) -> Vec<String> {
    let Some(regex) = FEED_LINK_REGEX.as_ref() else {
        return Vec::new();
    };

    regex
        .captures_iter(html)
        .filter_map(|caps| caps.get(2))
        .filter_map(|href| resolve_url(href.as_str(), base))
        .collect()
}

/// [`COMMON_FEED_PATHS`] joined to the origin of `base`.
pub fn common_feed_paths(base: &Url) -> Vec<String> {
    COMMON_FEED_PATHS
        .iter()
        .filter_map(|path| base.join(path).ok())
        .map(|url| url.to_string())
        .collect()
}

fn is_feed_type(kind: &str) -> bool {
    [
        "application/rss+xml",
        "application/atom+xml",
        "application/rdf+xml",
        "text/xml",
        "application/xml",
    ]
    .iter()
    .any(|t| kind.contains(t))
}

fn has_feed_path(href: &str) -> bool {
    let href = href.to_lowercase();
    ["rss", "feed", "atom", ".xml"]
        .iter()
        .any(|token| href.contains(token))
}

/// Resolves `href` against `base`. Only http(s) results are returned.
pub fn resolve_url(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    let resolved = base.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

/// Writes the page markup to `dir` with a small header describing why
/// discovery failed. Returns the written path, or `None` after logging.
pub fn save_failed_page(dir: &Path, page_url: &str, html: &str, reason: &str) -> Option<PathBuf> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to create debug output directory");
        return None;
    }

    let now = chrono::Utc::now();
    let hash = format!("{:x}", Sha256::digest(page_url.as_bytes()));
    let filename = format!("{}_{}_{}.html", now.format("%Y%m%d-%H%M%S"), reason, &hash[..8]);
    let path = dir.join(filename);

    let content = format!(
        "<!-- Debug Info\nURL: {}\nReason: {}\nTimestamp: {}\nContent Size: {} bytes\n-->\n\n{}",
        page_url,
        reason,
        now.to_rfc3339(),
        html.len(),
        html
    );

    match std::fs::write(&path, content) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(file_path = %path.display(), error = %e, "Failed to save page for debugging");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::feed::http::HttpConfig;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example Feed</title>
  <link>https://example.com/</link>
  <description>Posts</description>
</channel></rss>"#;

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    fn test_client() -> HttpClient {
        HttpClient::new(&HttpConfig {
            timeout: Duration::from_secs(5),
            ..HttpConfig::default()
        })
        .unwrap()
    }

    // --- Candidate extraction (no network) ---

    #[test]
    fn test_find_rss_link_resolves_against_origin() {
        let html = r#"<html><head><link rel="alternate" type="application/rss+xml" href="/feed"></head></html>"#;
        let links = find_feed_links(html, &base("https://example.com/blog/post"));
        assert_eq!(links, vec!["https://example.com/feed".to_string()]);
    }

    #[test]
    fn test_find_links_keeps_document_order() {
        let html = r#"<head>
<link rel="alternate" type="application/atom+xml" href="https://example.com/atom.xml">
<link rel="stylesheet" href="/style.css">
<link rel="alternate" type="application/rss+xml" href="rss.xml">
</head>"#;
        let links = find_feed_links(html, &base("https://example.com/blog/"));
        assert_eq!(
            links,
            vec![
                "https://example.com/atom.xml".to_string(),
                "https://example.com/blog/rss.xml".to_string(),
            ]
        );
    }

    #[test]
    fn test_permissive_match_on_href() {
        let html = r#"<link rel="alternate" href="/blog/feed/">"#;
        let links = find_feed_links(html, &base("https://example.com"));
        assert_eq!(links, vec!["https://example.com/blog/feed/".to_string()]);
    }

    #[test]
    fn test_alternate_language_link_ignored() {
        let html = r#"<link rel="alternate" hreflang="de" href="https://example.com/de/">"#;
        assert!(find_feed_links(html, &base("https://example.com")).is_empty());
    }

    #[test]
    fn test_non_http_href_ignored() {
        let html = r#"<link rel="alternate" type="application/rss+xml" href="javascript:void(0)">"#;
        assert!(find_feed_links(html, &base("https://example.com")).is_empty());
    }

    #[test]
    fn test_regex_fallback_finds_link() {
        let html = r#"<LINK REL="alternate" TYPE="application/atom+xml" HREF="/atom.xml" >"#;
        let links = find_feed_links_regex(html, &base("https://example.com/x"));
        assert_eq!(links, vec!["https://example.com/atom.xml".to_string()]);
    }

    #[test]
    fn test_common_paths_keep_port() {
        let paths = common_feed_paths(&base("http://localhost:8080/some/page"));
        assert_eq!(paths.len(), COMMON_FEED_PATHS.len());
        assert_eq!(paths[0], "http://localhost:8080/feed");
        assert_eq!(paths[7], "http://localhost:8080/.rss");
    }

    #[test]
    fn test_candidates_fall_back_to_common_paths() {
        let candidates = candidate_feed_urls("<html><body>No feeds</body></html>", &base("https://example.com"));
        assert_eq!(candidates.len(), COMMON_FEED_PATHS.len());
    }

    #[test]
    fn test_resolve_url_variants() {
        let b = base("https://example.com/blog/post");
        assert_eq!(resolve_url("/feed", &b).unwrap(), "https://example.com/feed");
        assert_eq!(resolve_url("feed.xml", &b).unwrap(), "https://example.com/blog/feed.xml");
        assert_eq!(
            resolve_url("//cdn.example.com/rss", &b).unwrap(),
            "https://cdn.example.com/rss"
        );
        assert_eq!(
            resolve_url("  https://other.org/atom  ", &b).unwrap(),
            "https://other.org/atom"
        );
        assert!(resolve_url("", &b).is_none());
        assert!(resolve_url("mailto:me@example.com", &b).is_none());
    }

    #[test]
    fn test_save_failed_page_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_failed_page(dir.path(), "https://example.com", "<html></html>", "no_valid_feed").unwrap();

        let name = saved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("_no_valid_feed_"));
        assert!(name.ends_with(".html"));

        let content = std::fs::read_to_string(&saved).unwrap();
        assert!(content.starts_with("<!-- Debug Info\nURL: https://example.com\n"));
        assert!(content.ends_with("<html></html>"));
    }

    // --- Network tests with wiremock ---

    #[tokio::test]
    async fn test_discover_via_link_tag() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><link rel="alternate" type="application/rss+xml" href="/feed"></head></html>"#,
            ))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&mock_server)
            .await;

        let page_url = format!("{}/", mock_server.uri());
        let found = discover_feed(&test_client(), &page_url, &DiscoveryOptions::default())
            .await
            .unwrap();

        assert_eq!(found.feed_url, format!("{}/feed", mock_server.uri()));
        assert_eq!(found.feed_title, "Example Feed");
        assert_eq!(found.page_url, page_url);
    }

    #[tokio::test]
    async fn test_discover_skips_broken_candidate() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<head>
<link rel="alternate" type="application/rss+xml" href="/broken.xml">
<link rel="alternate" type="application/rss+xml" href="/not-xml">
<link rel="alternate" type="application/rss+xml" href="/good.xml">
</head>"#,
            ))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/not-xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/good.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .expect(1)
            .mount(&mock_server)
            .await;

        let found = discover_feed(&test_client(), &mock_server.uri(), &DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.feed_url, format!("{}/good.xml", mock_server.uri()));
    }

    #[tokio::test]
    async fn test_discover_common_path_fallback() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>plain</body></html>"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rss.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let found = discover_feed(&test_client(), &mock_server.uri(), &DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.feed_url, format!("{}/rss.xml", mock_server.uri()));
    }

    #[tokio::test]
    async fn test_discover_page_that_is_a_feed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/index.xml", mock_server.uri());
        let found = discover_feed(&test_client(), &url, &DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.feed_url, url);
    }

    #[tokio::test]
    async fn test_discover_no_valid_feed_saves_page() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>nothing</body></html>"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let options = DiscoveryOptions {
            user_agent: String::new(),
            debug_dir: Some(dir.path().to_path_buf()),
        };
        let err = discover_feed(&test_client(), &mock_server.uri(), &options)
            .await
            .unwrap_err();

        assert!(
            matches!(err, DiscoveryError::NoValidFeed { tried: 8 }),
            "Expected NoValidFeed(8), got {:?}",
            err
        );
        assert!(!err.is_transient());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_discover_page_fetch_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let err = discover_feed(&test_client(), &mock_server.uri(), &DiscoveryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Fetch(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_discover_invalid_url() {
        let err = discover_feed(&test_client(), "not a url", &DiscoveryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidUrl { .. }));
    }
}
