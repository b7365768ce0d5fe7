//! Configuration for both call paths.
//!
//! Settings are gathered with `AutoExtractConfigBuilder` and resolved once into
//! an immutable `AutoExtractConfig`. Environment fallbacks (API key, job
//! identifier) are consulted only inside `build()`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Level, info};
use url::Url;

use crate::error::{AutoExtractError, Result};
use crate::page_type::PageType;

pub const DEFAULT_API_URL: &str = "https://autoextract.scrapinghub.com/v1/extract";
pub const DEFAULT_COLLECTIONS_URL: &str = "https://storage.scrapinghub.com";
pub const API_KEY_ENV: &str = "SCRAPINGHUB_AUTOEXTRACT_KEY";
pub const JOB_ENV: &str = "SCRAPY_JOB";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(660);
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_MAX_QUERY_ERROR_RETRIES: u32 = 3;
const DEFAULT_CONCURRENT_REQUESTS_PER_DOMAIN: usize = 8;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Some sites answer 404 for pages that are perfectly valid.
pub const DEFAULT_ALLOWED_RESPONSE_ERROR: &str = "Downloader error: http404";

/// How intercepted requests are grouped for concurrency purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// One slot per target domain.
    #[default]
    PerDomain,
    /// All extraction calls share a single slot.
    SingleSlot,
    /// Leave slot assignment to the crawler.
    FrameworkDefault,
}

/// Where extraction results are cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheSettings {
    #[default]
    None,
    File { path: PathBuf, compressed: bool },
    Collection {
        endpoint: String,
        project: String,
        name: String,
    },
}

/// Resolved settings shared by the middleware, the provider and the extractor.
///
/// Built once through [`AutoExtractConfig::builder`] and handed around in an
/// `Arc`. The `Debug` output never shows the API key.
pub struct AutoExtractConfig {
    pub api_key: String,
    pub api_url: Url,
    pub timeout: Duration,
    pub download_timeout: Duration,
    pub page_type: Option<PageType>,
    pub slot_policy: SlotPolicy,
    pub max_query_error_retries: u32,
    pub concurrent_requests_per_domain: usize,
    /// Delay before an intercepted request whose extraction is still running
    /// is looked at again.
    pub poll_interval: Duration,
    pub cache: CacheSettings,
    pub allowed_response_errors: BTreeSet<String>,
    pub response_error_log_level: Level,
}

impl AutoExtractConfig {
    pub fn builder() -> AutoExtractConfigBuilder {
        AutoExtractConfigBuilder::default()
    }

    /// Timeout applied to each intercepted call; never shorter than the
    /// crawler's own download timeout.
    pub fn attempt_timeout(&self) -> Duration {
        self.timeout.max(self.download_timeout)
    }

    pub fn is_allowed_response_error(&self, message: &str) -> bool {
        self.allowed_response_errors.contains(message)
    }
}

impl fmt::Debug for AutoExtractConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoExtractConfig")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url.as_str())
            .field("timeout", &self.timeout)
            .field("download_timeout", &self.download_timeout)
            .field("page_type", &self.page_type)
            .field("slot_policy", &self.slot_policy)
            .field("max_query_error_retries", &self.max_query_error_retries)
            .field("concurrent_requests_per_domain", &self.concurrent_requests_per_domain)
            .field("poll_interval", &self.poll_interval)
            .field("cache", &self.cache)
            .field("allowed_response_errors", &self.allowed_response_errors)
            .field("response_error_log_level", &self.response_error_log_level)
            .finish()
    }
}

/// Builder for `AutoExtractConfig`.
#[derive(Debug, Clone)]
pub struct AutoExtractConfigBuilder {
    api_key: Option<String>,
    api_url: Option<String>,
    timeout: Duration,
    download_timeout: Duration,
    page_type: Option<PageType>,
    slot_policy: SlotPolicy,
    max_query_error_retries: u32,
    concurrent_requests_per_domain: usize,
    poll_interval: Duration,
    cache_file: Option<(PathBuf, bool)>,
    cache_collection: Option<(Option<String>, Option<String>)>,
    collections_url: Option<String>,
    allowed_response_errors: BTreeSet<String>,
    response_error_log_level: Level,
}

impl Default for AutoExtractConfigBuilder {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: None,
            timeout: DEFAULT_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            page_type: None,
            slot_policy: SlotPolicy::default(),
            max_query_error_retries: DEFAULT_MAX_QUERY_ERROR_RETRIES,
            concurrent_requests_per_domain: DEFAULT_CONCURRENT_REQUESTS_PER_DOMAIN,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cache_file: None,
            cache_collection: None,
            collections_url: None,
            allowed_response_errors: BTreeSet::new(),
            response_error_log_level: Level::DEBUG,
        }
    }
}

impl AutoExtractConfigBuilder {
    /// Sets the API key. Takes precedence over the environment.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = Some(api_url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The crawler's download timeout, used as a lower bound for `timeout`.
    pub fn download_timeout(mut self, download_timeout: Duration) -> Self {
        self.download_timeout = download_timeout;
        self
    }

    /// Default page type when neither request meta nor the spider set one.
    pub fn page_type(mut self, page_type: PageType) -> Self {
        self.page_type = Some(page_type);
        self
    }

    pub fn slot_policy(mut self, slot_policy: SlotPolicy) -> Self {
        self.slot_policy = slot_policy;
        self
    }

    /// Total attempts the provider path makes for a query that keeps failing.
    pub fn max_query_error_retries(mut self, max_query_error_retries: u32) -> Self {
        self.max_query_error_retries = max_query_error_retries;
        self
    }

    /// Extraction calls running at once within one slot.
    pub fn concurrent_requests_per_domain(mut self, concurrency: usize) -> Self {
        self.concurrent_requests_per_domain = concurrency;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Caches results on the local filesystem. Relative paths are resolved
    /// against the platform cache directory.
    pub fn cache_file(mut self, path: impl Into<PathBuf>, compressed: bool) -> Self {
        self.cache_file = Some((path.into(), compressed));
        self
    }

    /// Caches results in a remote collection. Missing values are derived from
    /// the job identifier in the environment.
    pub fn cache_collection(mut self, project: Option<String>, name: Option<String>) -> Self {
        self.cache_collection = Some((project, name));
        self
    }

    pub fn collections_url(mut self, url: impl Into<String>) -> Self {
        self.collections_url = Some(url.into());
        self
    }

    /// Adds a query error message that should be treated as a valid result.
    pub fn allowed_response_error(mut self, message: impl Into<String>) -> Self {
        self.allowed_response_errors.insert(message.into());
        self
    }

    pub fn response_error_log_level(mut self, level: Level) -> Self {
        self.response_error_log_level = level;
        self
    }

    /// Resolves the configuration using the process environment for fallbacks.
    pub fn build(self) -> Result<AutoExtractConfig> {
        self.build_with_env(|name| std::env::var(name).ok())
    }

    /// Resolves the configuration, looking fallbacks up through `env`.
    pub fn build_with_env(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<AutoExtractConfig> {
        let api_key = self
            .api_key
            .filter(|key| !key.is_empty())
            .or_else(|| env(API_KEY_ENV).filter(|key| !key.is_empty()))
            .ok_or_else(|| {
                AutoExtractError::ConfigurationError(format!(
                    "An API key is required: set it explicitly or through {API_KEY_ENV}"
                ))
            })?;

        let api_url = Url::parse(self.api_url.as_deref().unwrap_or(DEFAULT_API_URL))?;

        let cache = match (self.cache_file, self.cache_collection) {
            (Some(_), Some(_)) => {
                return Err(AutoExtractError::ConfigurationError(
                    "File and collection caches are mutually exclusive".to_string(),
                ));
            }
            (Some((path, compressed)), None) => CacheSettings::File {
                path: resolve_cache_path(path)?,
                compressed,
            },
            (None, Some((project, name))) => {
                let job = env(JOB_ENV).filter(|job| !job.is_empty());
                let project = project
                    .or_else(|| {
                        job.as_deref()
                            .and_then(|job| job.split('/').next())
                            .map(str::to_string)
                    })
                    .ok_or_else(|| {
                        AutoExtractError::ConfigurationError(format!(
                            "A project is required for the collection cache: \
                             set it explicitly or through {JOB_ENV}"
                        ))
                    })?;
                let name = name.unwrap_or_else(|| collection_name(job.as_deref()));
                CacheSettings::Collection {
                    endpoint: self
                        .collections_url
                        .unwrap_or_else(|| DEFAULT_COLLECTIONS_URL.to_string()),
                    project,
                    name,
                }
            }
            (None, None) => CacheSettings::None,
        };

        let mut allowed_response_errors = self.allowed_response_errors;
        allowed_response_errors.insert(DEFAULT_ALLOWED_RESPONSE_ERROR.to_string());

        let config = AutoExtractConfig {
            api_key,
            api_url,
            timeout: self.timeout,
            download_timeout: self.download_timeout,
            page_type: self.page_type,
            slot_policy: self.slot_policy,
            max_query_error_retries: self.max_query_error_retries,
            concurrent_requests_per_domain: self.concurrent_requests_per_domain.max(1),
            poll_interval: self.poll_interval,
            cache,
            allowed_response_errors,
            response_error_log_level: self.response_error_log_level,
        };
        info!("Using AutoExtract API URL: {}", config.api_url);
        info!("Initializing AutoExtractConfig with config: {:?}", config);
        Ok(config)
    }
}

fn resolve_cache_path(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let base = dirs::cache_dir().ok_or_else(|| {
        AutoExtractError::ConfigurationError("Could not determine cache directory".to_string())
    })?;
    Ok(base.join("spider-autoextract").join(path))
}

fn collection_name(job: Option<&str>) -> String {
    match job {
        Some(job) => format!("{}_cache", job.replace('/', "_")),
        None => "dev_cache".to_string(),
    }
}
