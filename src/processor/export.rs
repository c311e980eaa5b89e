use crate::cache::{CacheLookup, DiscoveryCache};
use crate::feed::{discover_feed, DiscoveredFeed, DiscoveryOptions, HttpClient};
use crate::linkding::Bookmark;
use crate::retry::{retry_with_backoff, RetryPolicy, Transient};
use crate::stats::{ProcessingStats, StatsSummary};

use super::{process_items, DiscoveryItem, ItemStatus};

/// Settings for a bookmarks → feeds run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub concurrency: usize,
    /// Cached results older than this are rediscovered.
    pub max_age_hours: u64,
    pub retry: RetryPolicy,
    pub discovery: DiscoveryOptions,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            concurrency: 16,
            max_age_hours: 720,
            retry: RetryPolicy::default(),
            discovery: DiscoveryOptions::default(),
        }
    }
}

/// Outcome of an export run.
#[derive(Debug, Clone)]
pub struct ExportReport {
    /// Every bookmark with its final status, in input order.
    pub items: Vec<DiscoveryItem>,
    /// Successful discoveries, ready for the OPML writer.
    pub feeds: Vec<DiscoveredFeed>,
    pub stats: StatsSummary,
}

/// Discovers feeds for `bookmarks`, consulting and updating `cache`.
///
/// The cache is saved once after every bookmark has been processed.
pub async fn export_bookmarks(
    client: &HttpClient,
    cache: &DiscoveryCache,
    bookmarks: &[Bookmark],
    options: &ExportOptions,
) -> ExportReport {
    let stats = ProcessingStats::new(bookmarks.len());
    let items = bookmarks.iter().map(DiscoveryItem::from_bookmark).collect();

    let stats_ref = &stats;
    let items = process_items(items, options.concurrency, &stats, Some(cache), move |item| {
        export_item(client, cache, stats_ref, options, item)
    })
    .await;

    let feeds = items
        .iter()
        .filter(|item| item.status == ItemStatus::Success)
        .filter_map(|item| {
            Some(DiscoveredFeed {
                feed_url: item.discovered_url.clone()?,
                feed_title: item.final_title().to_string(),
                page_url: item.source.clone(),
            })
        })
        .collect();

    let stats = stats.finish();
    tracing::info!(
        total_processed = stats.processed,
        successful_feeds = stats.succeeded,
        failed_discoveries = stats.failed,
        cache_hits = stats.cache_hits,
        new_discoveries = stats.new_discoveries,
        stale_refreshes = stats.stale_refreshes,
        "Completed bookmark processing"
    );

    ExportReport { items, feeds, stats }
}

/// Forward discovery for one bookmark.
///
/// A fresh cache entry short-circuits the network: a positive entry is a
/// success, a negative one a failure. Otherwise discovery runs (retrying
/// transient failures) and the outcome, found or not, is written back.
pub async fn export_item(
    client: &HttpClient,
    cache: &DiscoveryCache,
    stats: &ProcessingStats,
    options: &ExportOptions,
    mut item: DiscoveryItem,
) -> DiscoveryItem {
    match cache.lookup(&item.source, options.max_age_hours) {
        CacheLookup::Fresh(entry) => {
            stats.record_cache_hit();
            item.from_cache = true;
            tracing::debug!(url = %item.source, age = %(chrono::Utc::now() - entry.timestamp), "Using cached feed discovery result");

            if entry.is_negative() {
                item.fail("no feed found (cached)");
            } else {
                item.set_discovered(&entry.feed_url, &entry.feed_title, "");
                item.succeed();
            }
            return item;
        }
        CacheLookup::Stale(_) => {
            stats.record_stale_refresh();
            tracing::debug!(url = %item.source, "Cached result expired, rediscovering");
        }
        CacheLookup::Missing => {
            stats.record_new_discovery();
            tracing::debug!(url = %item.source, "Performing new feed discovery");
        }
    }

    let page_url = item.source.clone();
    let result = retry_with_backoff(options.retry, "feed discovery", || {
        discover_feed(client, &page_url, &options.discovery)
    })
    .await;

    match result {
        Ok(found) => {
            cache.set(&item.source, &found.feed_url, &found.feed_title);
            item.set_discovered(&found.feed_url, &found.feed_title, "");
            item.succeed();
        }
        // Only a definitive "no feed" is remembered; a site that was
        // merely unreachable is tried again on the next run.
        Err(e) if e.is_transient() => {
            tracing::debug!(url = %item.source, error = %e, "Transient discovery failure not cached");
            item.fail(e);
        }
        Err(e) => {
            cache.set(&item.source, "", "");
            item.fail(e);
        }
    }
    item
}
