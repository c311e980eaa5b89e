//! Feed discovery in both directions, plus the fetching and parsing they
//! share.
//!
//! - [`http`] - page fetching with browser headers, redirect ceiling and
//!   transparent gzip/deflate decoding
//! - [`parser`] - channel metadata from RSS 2.0, Atom and RSS 1.0/RDF
//! - [`discovery`] - page → feed (autodiscovery links, regex scan, common paths)
//! - [`reverse`] - feed → page (OPML hint, feed link, feed URL)
//! - [`opml`] - reading subscription lists and writing discovery results

pub mod discovery;
pub mod http;
pub mod opml;
pub mod parser;
pub mod reverse;

pub use discovery::{discover_feed, DiscoveredFeed, DiscoveryError, DiscoveryOptions};
pub use http::{FetchError, HttpClient, HttpConfig};
pub use opml::{OpmlEntry, OpmlError};
pub use parser::{parse_feed, FeedDialect, ParseError, ParsedFeed};
pub use reverse::{
    discover_bookmark_url, fallback_to_feed_url, BookmarkTarget, FeedReference, Resolution,
    ReverseDiscoveryError,
};
