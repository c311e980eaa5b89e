//! Converts Linkding bookmarks into an OPML feed list and back.
//!
//! Export walks each bookmarked page looking for the feed it publishes
//! (HTML `<link>` tags, then a regex scan, then common feed paths) and
//! remembers the answer in a [`cache::DiscoveryCache`]. Import goes the
//! other way: for each OPML outline it finds the website the feed belongs
//! to and creates or updates the matching bookmark.

pub mod cache;
pub mod config;
pub mod feed;
pub mod linkding;
pub mod processor;
pub mod retry;
pub mod stats;
pub mod util;
