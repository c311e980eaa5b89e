use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;

use crate::feed::{
    discover_bookmark_url, fallback_to_feed_url, BookmarkTarget, FeedReference, HttpClient,
    OpmlEntry, ReverseDiscoveryError,
};
use crate::linkding::{BookmarkService, LinkdingError, NewBookmark};
use crate::retry::{retry_with_backoff, RetryPolicy, Transient};
use crate::stats::{ProcessingStats, StatsSummary};

use super::{process_items, DiscoveryItem};

/// What to do when the target URL is already bookmarked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Leave the existing bookmark untouched
    #[default]
    Skip,
    /// Overwrite the existing bookmark's title, description and tags
    Update,
}

impl std::fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicatePolicy::Skip => f.write_str("skip"),
            DuplicatePolicy::Update => f.write_str("update"),
        }
    }
}

/// Settings for a feeds → bookmarks run.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub concurrency: usize,
    pub duplicates: DuplicatePolicy,
    /// Applied to every created or updated bookmark.
    pub tags: Vec<String>,
    /// Log what would change without calling the bookmark service.
    pub dry_run: bool,
    pub retry: RetryPolicy,
    /// User-Agent for feed fetches during reverse discovery.
    pub user_agent: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            concurrency: 16,
            duplicates: DuplicatePolicy::Skip,
            tags: Vec::new(),
            dry_run: false,
            retry: RetryPolicy::default(),
            user_agent: String::new(),
        }
    }
}

/// Result of duplicate resolution for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Created,
    Updated,
    Skipped,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Discovery(#[from] ReverseDiscoveryError),
    #[error("bookmark service error: {0}")]
    Service(#[from] LinkdingError),
}

impl Transient for ImportError {
    fn is_transient(&self) -> bool {
        match self {
            ImportError::Discovery(e) => e.is_transient(),
            ImportError::Service(e) => e.is_transient(),
        }
    }
}

/// Outcome of an import run.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub items: Vec<DiscoveryItem>,
    pub stats: StatsSummary,
}

/// Creates or updates bookmarks for every feed entry.
pub async fn import_entries(
    client: &HttpClient,
    service: &dyn BookmarkService,
    entries: &[OpmlEntry],
    options: &ImportOptions,
) -> ImportReport {
    tracing::info!(
        total_items = entries.len(),
        dry_run = options.dry_run,
        duplicates = %options.duplicates,
        global_tags = ?options.tags,
        "Starting import"
    );

    let stats = ProcessingStats::new(entries.len());
    let items = entries.iter().map(DiscoveryItem::from_opml).collect();

    let items = process_items(items, options.concurrency, &stats, None, move |item| {
        import_item(client, service, options, item)
    })
    .await;

    let stats = stats.finish();
    tracing::info!(
        total = stats.total,
        processed = stats.processed,
        imported = stats.created(),
        updated = stats.updated,
        skipped = stats.skipped,
        failed = stats.failed,
        duration = ?stats.duration(),
        "Completed import"
    );

    ImportReport { items, stats }
}

/// Reverse discovery then duplicate resolution for one feed entry, each
/// step retried on transient failure. A feed that still cannot be fetched
/// after the last attempt is bookmarked by its own URL.
pub async fn import_item(
    client: &HttpClient,
    service: &dyn BookmarkService,
    options: &ImportOptions,
    mut item: DiscoveryItem,
) -> DiscoveryItem {
    let user_agent = if options.user_agent.is_empty() {
        client.user_agent()
    } else {
        options.user_agent.as_str()
    };

    let discovered = {
        let reference = FeedReference {
            feed_url: &item.source,
            page_hint: item.page_hint.as_deref(),
            title: &item.title,
            description: &item.description,
        };
        let result = retry_with_backoff(options.retry, "URL discovery", || {
            discover_bookmark_url(client, user_agent, reference)
        })
        .await;
        match result {
            Err(ReverseDiscoveryError::Fetch(e)) => {
                tracing::warn!(title = %item.title, xml_url = %item.source, error = %e, "Feed unreachable, falling back to feed URL");
                fallback_to_feed_url(reference)
            }
            other => other,
        }
    };

    let target = match discovered {
        Ok(target) => target,
        Err(e) => {
            tracing::error!(title = %item.title, error = %e, "URL discovery failed");
            item.fail(e);
            return item;
        }
    };
    item.set_discovered(&target.url, &target.title, &target.description);

    let target = BookmarkTarget {
        url: item.final_url().to_string(),
        title: item.final_title().to_string(),
        description: item.final_description().to_string(),
        resolution: target.resolution,
    };

    let resolved = retry_with_backoff(options.retry, "bookmark processing", || {
        resolve_duplicate(service, &target, options)
    })
    .await;

    match resolved {
        Ok(ImportOutcome::Created) => item.succeed(),
        Ok(ImportOutcome::Updated) => {
            item.was_updated = true;
            item.succeed();
        }
        Ok(ImportOutcome::Skipped) => item.skip(),
        Err(e) => {
            tracing::error!(title = %target.title, url = %target.url, error = %e, "Bookmark processing failed");
            item.fail(e);
        }
    }
    item
}

/// Creates, updates or skips a bookmark for `target`.
///
/// In dry-run mode the service is never contacted: the lookup is simulated
/// as "not found", so every target takes the create branch and is only
/// logged.
pub async fn resolve_duplicate(
    service: &dyn BookmarkService,
    target: &BookmarkTarget,
    options: &ImportOptions,
) -> Result<ImportOutcome, ImportError> {
    let existing = if options.dry_run {
        None
    } else {
        service.get_bookmark_by_url(&target.url).await?
    };
    let fields = NewBookmark::new(&target.url, &target.title, &target.description, &options.tags);

    let Some(existing) = existing else {
        if options.dry_run {
            tracing::info!(url = %target.url, title = %target.title, tags = ?options.tags, "Would create new bookmark (dry run)");
        } else {
            service.create_bookmark(&fields).await?;
            tracing::info!(url = %target.url, title = %target.title, tags = ?options.tags, "Created new bookmark");
        }
        return Ok(ImportOutcome::Created);
    };

    tracing::debug!(
        existing_id = existing.id,
        existing_title = %existing.title,
        new_title = %target.title,
        action = %options.duplicates,
        "Found existing bookmark"
    );

    match options.duplicates {
        DuplicatePolicy::Skip => {
            tracing::info!(url = %target.url, title = %target.title, "Skipping duplicate bookmark");
            Ok(ImportOutcome::Skipped)
        }
        DuplicatePolicy::Update => {
            service.update_bookmark(existing.id, &fields).await?;
            tracing::info!(id = existing.id, url = %target.url, title = %target.title, "Updated existing bookmark");
            Ok(ImportOutcome::Updated)
        }
    }
}
