use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use linkding_to_opml::cache::DiscoveryCache;
use linkding_to_opml::config::{Config, DEFAULT_CONFIG_PATH};
use linkding_to_opml::feed::{opml, HttpClient};
use linkding_to_opml::linkding::{BookmarkService, LinkdingClient, OfflineService};
use linkding_to_opml::processor::{
    export_bookmarks, import_entries, DiscoveryItem, DuplicatePolicy, ExportOptions,
    ImportOptions, ItemStatus,
};
use linkding_to_opml::stats::StatsSummary;

const OPML_TITLE: &str = "Linkding Bookmarks Feeds";

#[derive(Parser, Debug)]
#[command(
    name = "linkding-to-opml",
    version,
    about = "Convert Linkding bookmarks to an OPML feed list and back"
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    /// Do not print the run summary
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover feeds for Linkding bookmarks and write them as OPML
    Export(ExportArgs),
    /// Create Linkding bookmarks from the feeds in an OPML file
    Import(ImportArgs),
}

#[derive(Args, Debug)]
struct LinkdingArgs {
    /// Linkding base URL (overrides config and environment)
    #[arg(long, value_name = "URL")]
    linkding_url: Option<String>,

    /// Linkding API token (overrides config and environment)
    #[arg(long, value_name = "TOKEN")]
    linkding_token: Option<String>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Only export bookmarks carrying all of these tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// OPML output file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Discovery cache file
    #[arg(long, value_name = "FILE")]
    cache: Option<PathBuf>,

    /// Rediscover cached results older than this many hours
    #[arg(long, value_name = "HOURS")]
    max_age: Option<u64>,

    /// Maximum bookmarks processed at once
    #[arg(short, long)]
    concurrency: Option<usize>,

    #[command(flatten)]
    linkding: LinkdingArgs,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// OPML file to import
    #[arg(value_name = "OPML")]
    opml: PathBuf,

    /// Show what would change without touching Linkding
    #[arg(long)]
    dry_run: bool,

    /// How to handle feeds whose website is already bookmarked
    #[arg(long, value_enum)]
    duplicates: Option<DuplicatePolicy>,

    /// Tags added to every imported bookmark
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Maximum feeds processed at once
    #[arg(short, long)]
    concurrency: Option<usize>,

    #[command(flatten)]
    linkding: LinkdingArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config file '{}'", cli.config.display()))?;
    config.apply_env();

    match cli.command {
        Command::Export(args) => run_export(config, args, cli.quiet).await,
        Command::Import(args) => run_import(config, args, cli.quiet).await,
    }
}

/// `RUST_LOG` wins; otherwise the level comes from `--debug` / `--verbose`.
fn init_tracing(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_linkding_args(config: &mut Config, args: LinkdingArgs) {
    if let Some(url) = args.linkding_url {
        config.linkding.url = Some(url);
    }
    if let Some(token) = args.linkding_token {
        config.linkding.token = Some(token);
    }
}

/// Builds the Linkding client from validated settings.
fn linkding_client(config: &Config) -> Result<LinkdingClient> {
    let url = config.linkding.url.as_deref().unwrap_or_default();
    let token = SecretString::from(config.linkding.token.clone().unwrap_or_default());
    LinkdingClient::new(url, token, Duration::from_secs(config.linkding.timeout_secs))
        .context("Failed to create Linkding client")
}

async fn run_export(mut config: Config, args: ExportArgs, quiet: bool) -> Result<()> {
    apply_linkding_args(&mut config, args.linkding);
    if !args.tags.is_empty() {
        config.tags = args.tags;
    }
    if let Some(output) = args.output {
        config.output = output;
    }
    if let Some(cache) = args.cache {
        config.cache.file_path = cache;
    }
    if let Some(max_age) = args.max_age {
        config.cache.max_age_hours = max_age;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.validate(true)?;
    tracing::debug!(config = ?config, "Starting export");

    let linkding = linkding_client(&config)?;
    let bookmarks = linkding
        .fetch_bookmarks(&config.tags)
        .await
        .context("Failed to fetch bookmarks from Linkding")?;

    let client = HttpClient::new(&config.http_config()).context("Failed to create HTTP client")?;
    let cache = DiscoveryCache::load(&config.cache.file_path);
    let cache_stats = cache.stats();
    tracing::info!(
        path = %config.cache.file_path.display(),
        entries = cache_stats.total,
        with_feed = cache_stats.with_feed,
        "Discovery cache ready"
    );

    let options = ExportOptions {
        concurrency: config.concurrency,
        max_age_hours: config.cache.max_age_hours,
        retry: config.retry_policy(),
        discovery: config.discovery_options(),
    };
    let report = export_bookmarks(&client, &cache, &bookmarks, &options).await;

    opml::export_to_file(&report.feeds, OPML_TITLE, &config.output)
        .with_context(|| format!("Failed to write OPML file '{}'", config.output.display()))?;

    if !quiet {
        print_failures(&report.items);
        println!(
            "Exported {} feeds to {}",
            report.feeds.len(),
            config.output.display()
        );
        print_summary(&report.stats);
        println!(
            "Cache: {} hits, {} new discoveries, {} stale refreshes",
            report.stats.cache_hits, report.stats.new_discoveries, report.stats.stale_refreshes
        );
    }

    fail_on_errors(&report.stats, "bookmarks")
}

async fn run_import(mut config: Config, args: ImportArgs, quiet: bool) -> Result<()> {
    ensure_file(&args.opml)?;

    apply_linkding_args(&mut config, args.linkding);
    if args.dry_run {
        config.import.dry_run = true;
    }
    if let Some(duplicates) = args.duplicates {
        config.import.duplicates = duplicates;
    }
    if !args.tags.is_empty() {
        config.import.tags = args.tags;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.validate(!config.import.dry_run)?;
    tracing::debug!(config = ?config, "Starting import");

    let entries = opml::parse(&args.opml)
        .await
        .with_context(|| format!("Failed to parse OPML file '{}'", args.opml.display()))?;
    tracing::info!(feeds = entries.len(), path = %args.opml.display(), "Extracted feeds from OPML");

    let has_credentials = config.linkding.url.is_some() && config.linkding.token.is_some();
    let service: Box<dyn BookmarkService> = if has_credentials {
        Box::new(linkding_client(&config)?)
    } else {
        Box::new(OfflineService)
    };

    let client = HttpClient::new(&config.http_config()).context("Failed to create HTTP client")?;
    let options = ImportOptions {
        concurrency: config.concurrency,
        duplicates: config.import.duplicates,
        tags: config.import.tags.clone(),
        dry_run: config.import.dry_run,
        retry: config.retry_policy(),
        user_agent: config.http.user_agent.clone(),
    };
    let report = import_entries(&client, &*service, &entries, &options).await;

    if !quiet {
        print_failures(&report.items);
        if options.dry_run {
            println!("Dry run: no bookmarks were changed");
        }
        println!(
            "Imported {} bookmarks ({} created, {} updated, {} skipped)",
            report.stats.succeeded,
            report.stats.created(),
            report.stats.updated,
            report.stats.skipped
        );
        print_summary(&report.stats);
    }

    fail_on_errors(&report.stats, "feeds")
}

fn ensure_file(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("OPML file not found: {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("OPML path must be a regular file: {}", path.display());
    }
    Ok(())
}

fn print_failures(items: &[DiscoveryItem]) {
    for item in items.iter().filter(|i| i.status == ItemStatus::Failed) {
        eprintln!(
            "  failed: {} ({})",
            item.source,
            item.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn print_summary(stats: &StatsSummary) {
    println!("Summary: {}", stats);
}

/// Output has already been written; a failed item still fails the run.
fn fail_on_errors(stats: &StatsSummary, noun: &str) -> Result<()> {
    if stats.failed > 0 {
        anyhow::bail!("{} of {} {} failed", stats.failed, stats.total, noun);
    }
    Ok(())
}
