//! Configuration file parser for `./linkding-to-opml.toml`.
//!
//! The config file is optional. A missing or empty file yields
//! `Config::default()`. Unknown keys are accepted by serde, but we log a
//! warning for each one since they are usually typos.
//!
//! Precedence, lowest first: defaults, file, environment, CLI flags. The
//! CLI layer is applied by the binary.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{DiscoveryOptions, HttpConfig};
use crate::processor::DuplicatePolicy;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "./linkding-to-opml.toml";

pub const ENV_LINKDING_URL: &str = "LINKDING_TO_OPML_URL";
pub const ENV_LINKDING_TOKEN: &str = "LINKDING_TO_OPML_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// Every section uses `#[serde(default)]` so any subset of keys can be
/// specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub linkding: LinkdingSettings,
    pub cache: CacheSettings,
    pub http: HttpSettings,
    pub import: ImportSettings,
    pub debug: DebugSettings,

    /// OPML file written by `export`.
    pub output: PathBuf,
    /// Only export bookmarks carrying all of these tags.
    pub tags: Vec<String>,
    pub concurrency: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            linkding: LinkdingSettings::default(),
            cache: CacheSettings::default(),
            http: HttpSettings::default(),
            import: ImportSettings::default(),
            debug: DebugSettings::default(),
            output: PathBuf::from("feeds.opml"),
            tags: Vec::new(),
            concurrency: 16,
            retry_attempts: 3,
            retry_backoff_ms: 1000,
        }
    }
}

/// Masks `token` in Debug output so it never reaches logs.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LinkdingSettings {
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LinkdingSettings {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for LinkdingSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkdingSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub file_path: PathBuf,
    pub max_age_hours: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("./linkding-to-opml-cache.json"),
            max_age_hours: 720,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// 0 disables redirect following.
    pub max_redirects: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        let http = HttpConfig::default();
        Self {
            timeout_secs: http.timeout.as_secs(),
            user_agent: http.user_agent,
            max_redirects: http.max_redirects,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    pub duplicates: DuplicatePolicy,
    /// Added to every imported bookmark.
    pub tags: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    /// Keep the markup of pages where no feed could be found.
    pub save_failed_html: bool,
    pub output_dir: PathBuf,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            save_failed_html: false,
            output_dir: PathBuf::from("./debug"),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "linkding",
    "cache",
    "http",
    "import",
    "debug",
    "output",
    "tags",
    "concurrency",
    "retry_attempts",
    "retry_backoff_ms",
];

const KNOWN_SECTION_KEYS: &[(&str, &[&str])] = &[
    ("linkding", &["url", "token", "timeout_secs"]),
    ("cache", &["file_path", "max_age_hours"]),
    ("http", &["timeout_secs", "user_agent", "max_redirects"]),
    ("import", &["duplicates", "tags", "dry_run"]),
    ("debug", &["save_failed_html", "output_dir"]),
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check the size before reading so a huge file is never buffered.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Applies `LINKDING_TO_OPML_URL` / `LINKDING_TO_OPML_TOKEN` from the
    /// process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Like [`Config::apply_env`] with an explicit variable source. Empty
    /// values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_LINKDING_URL).filter(|v| !v.trim().is_empty()) {
            tracing::debug!(url = %url, "Using Linkding URL from environment");
            self.linkding.url = Some(url);
        }
        if let Some(token) = lookup(ENV_LINKDING_TOKEN).filter(|v| !v.trim().is_empty()) {
            tracing::debug!("Using Linkding token from environment");
            self.linkding.token = Some(token);
        }
    }

    /// Rejects settings that would fail later, before any network work.
    ///
    /// Linkding credentials are only required when `needs_linkding` is set;
    /// an import dry run never talks to the service.
    pub fn validate(&self, needs_linkding: bool) -> Result<(), ConfigError> {
        if needs_linkding {
            if self.linkding.url.as_deref().is_none_or(|u| u.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "Linkding URL is required (set linkding.url, {} or --linkding-url)",
                    ENV_LINKDING_URL
                )));
            }
            if self.linkding.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "Linkding token is required (set linkding.token, {} or --linkding-token)",
                    ENV_LINKDING_TOKEN
                )));
            }
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".to_string()));
        }
        if self.http.timeout_secs == 0 || self.linkding.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1 second".to_string()));
        }
        Ok(())
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: self.http.user_agent.clone(),
            max_redirects: self.http.max_redirects,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            user_agent: self.http.user_agent.clone(),
            debug_dir: self
                .debug
                .save_failed_html
                .then(|| self.debug.output_dir.clone()),
        }
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        let Some(table) = value.as_table() else {
            continue;
        };
        let Some((_, known)) = KNOWN_SECTION_KEYS.iter().find(|(section, _)| section == key) else {
            continue;
        };
        for nested in table.keys() {
            if !known.contains(&nested.as_str()) {
                tracing::warn!(key = %format!("{}.{}", key, nested), "Unknown key in config file, ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkding-to-opml.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn with_credentials() -> Config {
        let mut config = Config::default();
        config.linkding.url = Some("https://links.example".to_string());
        config.linkding.token = Some("secret".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.output, PathBuf::from("feeds.opml"));
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_backoff_ms, 1000);
        assert_eq!(config.cache.max_age_hours, 720);
        assert_eq!(config.http.max_redirects, 3);
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(config.import.duplicates, DuplicatePolicy::Skip);
        assert!(!config.import.dry_run);
        assert!(!config.debug.save_failed_html);
        assert!(config.linkding.url.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.concurrency, 16);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (_dir, path) = write_config("   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
output = "out/feeds.opml"
tags = ["rust", "blogs"]
concurrency = 4
retry_attempts = 5
retry_backoff_ms = 250

[linkding]
url = "https://links.example"
token = "abc123"
timeout_secs = 10

[cache]
file_path = "/tmp/cache.json"
max_age_hours = 24

[http]
timeout_secs = 15
user_agent = "test-agent"
max_redirects = 0

[import]
duplicates = "update"
tags = ["imported"]
dry_run = true

[debug]
save_failed_html = true
output_dir = "/tmp/debug"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.output, PathBuf::from("out/feeds.opml"));
        assert_eq!(config.tags, vec!["rust".to_string(), "blogs".to_string()]);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.linkding.url.as_deref(), Some("https://links.example"));
        assert_eq!(config.linkding.timeout_secs, 10);
        assert_eq!(config.cache.max_age_hours, 24);
        assert_eq!(config.http.max_redirects, 0);
        assert_eq!(config.import.duplicates, DuplicatePolicy::Update);
        assert!(config.import.dry_run);

        let retry = config.retry_policy();
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(250));

        let http = config.http_config();
        assert_eq!(http.timeout, Duration::from_secs(15));
        assert_eq!(http.user_agent, "test-agent");

        let discovery = config.discovery_options();
        assert_eq!(discovery.debug_dir, Some(PathBuf::from("/tmp/debug")));
    }

    #[test]
    fn test_partial_section_uses_defaults_for_missing() {
        let (_dir, path) = write_config("[cache]\nmax_age_hours = 1\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache.max_age_hours, 1);
        assert_eq!(
            config.cache.file_path,
            PathBuf::from("./linkding-to-opml-cache.json")
        );
        assert!(config.discovery_options().debug_dir.is_none());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_invalid_duplicate_policy_rejected() {
        let (_dir, path) = write_config("[import]\nduplicates = \"merge\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config(
            "concurrency = 2\ntotally_fake_key = 1\n[cache]\nmax_agee = 5\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.cache.max_age_hours, 720);
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = with_credentials();
        let env: HashMap<&str, &str> = [
            (ENV_LINKDING_URL, "https://env.example"),
            (ENV_LINKDING_TOKEN, "env-token"),
        ]
        .into_iter()
        .collect();

        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.linkding.url.as_deref(), Some("https://env.example"));
        assert_eq!(config.linkding.token.as_deref(), Some("env-token"));
    }

    #[test]
    fn test_empty_env_value_ignored() {
        let mut config = with_credentials();
        config.apply_env_from(|_| Some("  ".to_string()));
        assert_eq!(config.linkding.url.as_deref(), Some("https://links.example"));
    }

    #[test]
    fn test_validate() {
        assert!(with_credentials().validate(true).is_ok());

        // Credentials only matter when the service is used
        assert!(Config::default().validate(false).is_ok());
        let err = Config::default().validate(true).unwrap_err();
        assert!(err.to_string().contains("Linkding URL is required"));

        let mut config = with_credentials();
        config.linkding.token = None;
        assert!(config.validate(true).unwrap_err().to_string().contains("token"));

        let mut config = with_credentials();
        config.concurrency = 0;
        assert!(matches!(config.validate(true), Err(ConfigError::Invalid(_))));

        let mut config = with_credentials();
        config.retry_attempts = 0;
        assert!(matches!(config.validate(true), Err(ConfigError::Invalid(_))));

        let mut config = with_credentials();
        config.http.max_redirects = 0;
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_debug_masks_token() {
        let config = with_credentials();
        let debug_output = format!("{:?}", config);
        assert!(
            !debug_output.contains("secret\""),
            "Debug output should not contain the token"
        );
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_debug_shows_none_when_no_token() {
        let debug_output = format!("{:?}", Config::default());
        assert!(!debug_output.contains("[REDACTED]"));
    }
}
