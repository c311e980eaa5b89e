//! Bounded-concurrency driver for both discovery directions.
//!
//! [`process_items`] owns the fan-out: every item is handed to exactly one
//! invocation of the per-item operation, at most `concurrency` of them run
//! at once, and statistics are recorded from each item's terminal status.
//! Once the stream is drained the cache (if any) is saved exactly once.
//!
//! The per-item operations live in [`export`] (page → feed, cached) and
//! [`import`] (feed → page, then duplicate resolution).

pub mod export;
pub mod import;

use std::fmt;
use std::future::Future;

use futures::stream::{self, StreamExt};

use crate::cache::DiscoveryCache;
use crate::feed::OpmlEntry;
use crate::linkding::Bookmark;
use crate::stats::ProcessingStats;

pub use export::{export_bookmarks, export_item, ExportOptions, ExportReport};
pub use import::{
    import_entries, import_item, resolve_duplicate, DuplicatePolicy, ImportError, ImportOptions,
    ImportOutcome, ImportReport,
};

/// Lifecycle of a work item. Every item leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Success,
    Skipped,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Pending => f.write_str("pending"),
            ItemStatus::Success => f.write_str("success"),
            ItemStatus::Skipped => f.write_str("skipped"),
            ItemStatus::Failed => f.write_str("failed"),
        }
    }
}

/// One unit of work: a bookmark (export) or a feed entry (import).
///
/// Owned by a single worker while it is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryItem {
    /// Input position; results are returned in this order.
    pub index: usize,
    /// Bookmarked page URL (export) or feed URL (import).
    pub source: String,
    /// Website URL already known for a feed entry.
    pub page_hint: Option<String>,
    pub title: String,
    pub description: String,

    pub status: ItemStatus,
    /// Feed URL (export) or bookmark URL (import).
    pub discovered_url: Option<String>,
    pub discovered_title: String,
    pub discovered_description: String,
    pub error: Option<String>,
    /// An existing bookmark was overwritten rather than created.
    pub was_updated: bool,
    /// The result came from the discovery cache.
    pub from_cache: bool,
}

impl DiscoveryItem {
    pub fn new(source: &str, title: &str) -> Self {
        Self {
            index: 0,
            source: source.to_string(),
            page_hint: None,
            title: title.to_string(),
            description: String::new(),
            status: ItemStatus::Pending,
            discovered_url: None,
            discovered_title: String::new(),
            discovered_description: String::new(),
            error: None,
            was_updated: false,
            from_cache: false,
        }
    }

    pub fn from_bookmark(bookmark: &Bookmark) -> Self {
        let mut item = Self::new(&bookmark.url, &bookmark.title);
        item.description = bookmark.description.clone();
        item
    }

    pub fn from_opml(entry: &OpmlEntry) -> Self {
        let mut item = Self::new(&entry.xml_url, &entry.title);
        item.page_hint = entry.html_url.clone();
        item.description = entry.description.clone().unwrap_or_default();
        item
    }

    /// Records a discovery result; empty title/description fall back to
    /// the item's own.
    pub fn set_discovered(&mut self, url: &str, title: &str, description: &str) {
        self.discovered_url = Some(url.to_string());
        self.discovered_title = if title.is_empty() {
            self.title.clone()
        } else {
            title.to_string()
        };
        self.discovered_description = if description.is_empty() {
            self.description.clone()
        } else {
            description.to_string()
        };
    }

    pub fn succeed(&mut self) {
        self.status = ItemStatus::Success;
        self.error = None;
    }

    pub fn skip(&mut self) {
        self.status = ItemStatus::Skipped;
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.status = ItemStatus::Failed;
        self.error = Some(error.to_string());
    }

    /// Discovered URL, else the source.
    pub fn final_url(&self) -> &str {
        self.discovered_url.as_deref().unwrap_or(&self.source)
    }

    /// Discovered title, else the original title, else "Untitled".
    pub fn final_title(&self) -> &str {
        if !self.discovered_title.is_empty() {
            &self.discovered_title
        } else if !self.title.is_empty() {
            &self.title
        } else {
            "Untitled"
        }
    }

    pub fn final_description(&self) -> &str {
        if self.discovered_description.is_empty() {
            &self.description
        } else {
            &self.discovered_description
        }
    }
}

/// Runs `operation` over `items` with at most `concurrency` in flight.
///
/// Each item reaches `operation` exactly once. A failing item never stops
/// the others. Statistics are recorded from the status each call returns;
/// an item still `Pending` is counted as failed. After all items finish,
/// `cache` is saved once; a save failure is logged, not returned.
///
/// Returns the items in input order. A `concurrency` of 0 is treated as 1.
pub async fn process_items<F, Fut>(
    items: Vec<DiscoveryItem>,
    concurrency: usize,
    stats: &ProcessingStats,
    cache: Option<&DiscoveryCache>,
    operation: F,
) -> Vec<DiscoveryItem>
where
    F: FnMut(DiscoveryItem) -> Fut,
    Fut: Future<Output = DiscoveryItem>,
{
    let concurrency = concurrency.max(1);
    let total = items.len();

    tracing::info!(total_items = total, concurrency = concurrency, "Starting concurrent processing");

    let indexed = items.into_iter().enumerate().map(|(index, mut item)| {
        item.index = index;
        item
    });

    let mut results: Vec<DiscoveryItem> = stream::iter(indexed)
        .map(operation)
        .buffer_unordered(concurrency)
        .map(|mut item| {
            record(stats, &mut item);
            tracing::debug!(
                source = %item.source,
                status = %item.status,
                processed = stats.processed(),
                total = total,
                "Completed processing item"
            );
            item
        })
        .collect()
        .await;

    results.sort_by_key(|item| item.index);

    if let Some(cache) = cache {
        match cache.save() {
            Ok(()) => tracing::debug!(path = %cache.path().display(), "Saved discovery cache"),
            Err(e) => tracing::error!(error = %e, "Failed to save cache after processing"),
        }
    }

    results
}

fn record(stats: &ProcessingStats, item: &mut DiscoveryItem) {
    match item.status {
        ItemStatus::Success if item.was_updated => stats.record_update(),
        ItemStatus::Success => stats.record_success(),
        ItemStatus::Skipped => stats.record_skip(),
        ItemStatus::Failed => stats.record_failure(),
        ItemStatus::Pending => {
            tracing::warn!(source = %item.source, "Item finished without a status");
            item.fail("processing finished without a result");
            stats.record_failure();
        }
    }
}
