//! Reverse discovery: from a subscribed feed back to the website to bookmark.

use thiserror::Error;

use super::http::{FetchError, HttpClient};
use super::parser::parse_feed;
use crate::retry::Transient;

/// Borrowed view of a feed entry awaiting reverse discovery.
#[derive(Debug, Clone, Copy)]
pub struct FeedReference<'a> {
    pub feed_url: &'a str,
    /// Website URL already known from the subscription list (`htmlUrl`).
    pub page_hint: Option<&'a str>,
    pub title: &'a str,
    pub description: &'a str,
}

/// Which tier produced the bookmark URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The subscription list's own website URL.
    PageHint,
    /// The website link declared inside the feed.
    FeedLink,
    /// Nothing better was found; the feed URL itself is bookmarked.
    FeedUrl,
}

/// What to bookmark for a feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkTarget {
    pub url: String,
    pub title: String,
    pub description: String,
    pub resolution: Resolution,
}

#[derive(Debug, Error)]
pub enum ReverseDiscoveryError {
    /// Neither a feed URL nor a website hint was given
    #[error("no URL available for bookmark")]
    NoUrl,
    /// The feed could not be fetched, but a later attempt might succeed
    #[error("failed to fetch feed: {0}")]
    Fetch(#[source] FetchError),
}

impl Transient for ReverseDiscoveryError {
    fn is_transient(&self) -> bool {
        match self {
            ReverseDiscoveryError::NoUrl => false,
            ReverseDiscoveryError::Fetch(e) => e.is_transient(),
        }
    }
}

/// Resolves the website URL for a feed entry.
///
/// Tiers, first match wins:
/// 1. A page hint that differs from the feed URL is used as-is, without
///    fetching it.
/// 2. The feed is fetched and parsed; a declared website link wins, and the
///    feed's own title/description replace the entry's when non-empty.
/// 3. The feed URL itself.
///
/// A transient fetch failure in tier 2 (timeout, connection error, 429, 5xx)
/// is returned as [`ReverseDiscoveryError::Fetch`] so the caller can retry;
/// once retries are spent, [`fallback_to_feed_url`] finishes with tier 3.
/// Permanent fetch failures and parse failures fall through to tier 3
/// directly.
pub async fn discover_bookmark_url(
    client: &HttpClient,
    user_agent: &str,
    feed: FeedReference<'_>,
) -> Result<BookmarkTarget, ReverseDiscoveryError> {
    tracing::debug!(
        title = %feed.title,
        xml_url = %feed.feed_url,
        html_url = ?feed.page_hint,
        "Starting URL discovery"
    );

    if let Some(hint) = feed.page_hint.map(str::trim).filter(|h| !h.is_empty()) {
        if hint != feed.feed_url {
            tracing::debug!(title = %feed.title, html_url = %hint, "Using htmlUrl from OPML");
            return Ok(target(hint, feed.title, feed.description, Resolution::PageHint));
        }
    }

    if !feed.feed_url.is_empty() {
        match client.fetch_page(feed.feed_url, user_agent).await {
            Ok(body) => match parse_feed(body.as_bytes()) {
                Ok(parsed) if !parsed.link.is_empty() => {
                    tracing::debug!(
                        title = %feed.title,
                        website_link = %parsed.link,
                        feed_type = %parsed.dialect,
                        "Discovered website link from feed"
                    );
                    let title = prefer(&parsed.title, feed.title);
                    let description = prefer(&parsed.description, feed.description);
                    return Ok(target(&parsed.link, title, description, Resolution::FeedLink));
                }
                Ok(_) => {
                    tracing::debug!(xml_url = %feed.feed_url, "Feed declares no website link");
                }
                Err(e) => {
                    tracing::debug!(xml_url = %feed.feed_url, error = %e, "Failed to parse feed, will fall back to feed URL");
                }
            },
            Err(e) if e.is_transient() => {
                tracing::debug!(xml_url = %feed.feed_url, error = %e, "Failed to fetch feed");
                return Err(ReverseDiscoveryError::Fetch(e));
            }
            Err(e) => {
                tracing::debug!(xml_url = %feed.feed_url, error = %e, "Failed to fetch feed, will fall back to feed URL");
            }
        }
    }

    fallback_to_feed_url(feed)
}

/// Tier 3 on its own: bookmark the feed URL itself.
pub fn fallback_to_feed_url(
    feed: FeedReference<'_>,
) -> Result<BookmarkTarget, ReverseDiscoveryError> {
    if feed.feed_url.is_empty() {
        return Err(ReverseDiscoveryError::NoUrl);
    }

    tracing::info!(title = %feed.title, xml_url = %feed.feed_url, "No website link found, falling back to feed URL");
    Ok(target(feed.feed_url, feed.title, feed.description, Resolution::FeedUrl))
}

fn prefer<'a>(discovered: &'a str, original: &'a str) -> &'a str {
    if discovered.is_empty() {
        original
    } else {
        discovered
    }
}

fn target(url: &str, title: &str, description: &str, resolution: Resolution) -> BookmarkTarget {
    BookmarkTarget {
        url: url.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        resolution,
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

    fn test_client() -> HttpClient {
        HttpClient::new(&HttpConfig {
            timeout: Duration::from_secs(5),
            ..HttpConfig::default()
        })
        .unwrap()
    }

    fn reference<'a>(feed_url: &'a str, page_hint: Option<&'a str>) -> FeedReference<'a> {
        FeedReference {
            feed_url,
            page_hint,
            title: "Original Title",
            description: "Original description",
        }
    }

    #[tokio::test]
    async fn test_hint_used_without_fetching() {
        let mock_server = MockServer::start().await;
        // The hint 404s; tier 1 must never check it.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(0)
            .mount(&mock_server)
            .await;

        let feed_url = format!("{}/feed.xml", mock_server.uri());
        let hint = format!("{}/gone", mock_server.uri());
        let found = discover_bookmark_url(&test_client(), "ua", reference(&feed_url, Some(&hint)))
            .await
            .unwrap();

        assert_eq!(found.url, hint);
        assert_eq!(found.title, "Original Title");
        assert_eq!(found.resolution, Resolution::PageHint);
    }

    #[tokio::test]
    async fn test_feed_link_preferred_with_feed_metadata() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<rss version="2.0"><channel>
  <title>Feed Title</title>
  <link>https://blog.example.com/</link>
  <description>From the feed</description>
  <item><link>https://blog.example.com/post</link></item>
</channel></rss>"#,
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let feed_url = format!("{}/feed.xml", mock_server.uri());
        // A hint equal to the feed URL is no hint at all.
        let found = discover_bookmark_url(&test_client(), "ua", reference(&feed_url, Some(&feed_url)))
            .await
            .unwrap();

        assert_eq!(
            found,
            BookmarkTarget {
                url: "https://blog.example.com".to_string(),
                title: "Feed Title".to_string(),
                description: "From the feed".to_string(),
                resolution: Resolution::FeedLink,
            }
        );
    }

    #[tokio::test]
    async fn test_feed_without_description_keeps_original() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>Atom</title><link href="https://a.example/"/></feed>"#,
            ))
            .mount(&mock_server)
            .await;

        let feed_url = format!("{}/atom", mock_server.uri());
        let found = discover_bookmark_url(&test_client(), "ua", reference(&feed_url, None))
            .await
            .unwrap();

        assert_eq!(found.url, "https://a.example");
        assert_eq!(found.title, "Atom");
        assert_eq!(found.description, "Original description");
    }

    #[tokio::test]
    async fn test_falls_back_to_feed_url_when_feed_is_gone() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let feed_url = format!("{}/feed", mock_server.uri());
        let found = discover_bookmark_url(&test_client(), "ua", reference(&feed_url, None))
            .await
            .unwrap();

        assert_eq!(found.url, feed_url);
        assert_eq!(found.resolution, Resolution::FeedUrl);
    }

    #[tokio::test]
    async fn test_server_error_is_returned_as_transient() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let feed_url = format!("{}/feed", mock_server.uri());
        let err = discover_bookmark_url(&test_client(), "ua", reference(&feed_url, None))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReverseDiscoveryError::Fetch(FetchError::HttpStatus { status: 503, .. })
        ));
        assert!(err.is_transient());

        let found = fallback_to_feed_url(reference(&feed_url, None)).unwrap();
        assert_eq!(found.url, feed_url);
        assert_eq!(found.title, "Original Title");
        assert_eq!(found.resolution, Resolution::FeedUrl);
    }

    #[tokio::test]
    async fn test_falls_back_to_feed_url_without_link() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<rss><channel><title>No link</title></channel></rss>",
            ))
            .mount(&mock_server)
            .await;

        let feed_url = format!("{}/feed", mock_server.uri());
        let found = discover_bookmark_url(&test_client(), "ua", reference(&feed_url, Some("  ")))
            .await
            .unwrap();

        assert_eq!(found.url, feed_url);
        assert_eq!(found.title, "Original Title");
    }

    #[tokio::test]
    async fn test_no_url_is_error() {
        let err = discover_bookmark_url(&test_client(), "ua", reference("", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ReverseDiscoveryError::NoUrl));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_hint_only_entry() {
        let found = discover_bookmark_url(&test_client(), "ua", reference("", Some("https://site.example")))
            .await
            .unwrap();
        assert_eq!(found.url, "https://site.example");
    }
}
