use std::env;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::archivist::{ArchivistSettings, DEFAULT_BASE_URL, DEFAULT_NAMESPACE};
use crate::http::{
    DEFAULT_RATE_LIMIT_MS, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY_MS, DEFAULT_TIMEOUT_MS,
    HttpSettings,
};
use crate::lru::{DEFAULT_CAPACITY, DEFAULT_WINDOW};
use crate::mediawiki::MediaWikiSettings;
use crate::store::StoreBackend;
use crate::translate::{DEFAULT_CHUNK_SIZE, DEFAULT_WORKERS};

pub const DEFAULT_USER_AGENT: &str = "archivewatch/0.1";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchivewatchConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub translate: TranslateSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub namespace: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub backend: Option<String>,
    pub dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub page_capacity: Option<usize>,
    pub page_window_secs: Option<u64>,
    pub history_capacity: Option<usize>,
    pub history_window_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TranslateSection {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub workers: Option<usize>,
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
}

/// Every knob after env > config > default resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub wiki_url: String,
    pub api_url: String,
    pub namespace: String,
    pub http: HttpSettings,
    pub store_backend: StoreBackend,
    pub store_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub page_capacity: NonZeroUsize,
    pub page_window: Duration,
    pub history_capacity: NonZeroUsize,
    pub history_window: Duration,
    pub translate_endpoint: Option<String>,
    pub translate_api_key: Option<String>,
    pub translate_workers: usize,
    pub translate_chunk_size: usize,
}

impl ResolvedSettings {
    pub fn archivist_settings(&self) -> ArchivistSettings {
        ArchivistSettings {
            base_url: self.wiki_url.clone(),
            namespace: self.namespace.clone(),
            history_capacity: self.history_capacity,
            history_window: self.history_window,
        }
    }

    pub fn mediawiki_settings(&self) -> MediaWikiSettings {
        MediaWikiSettings {
            base_url: self.wiki_url.clone(),
            api_url: self.api_url.clone(),
            http: self.http.clone(),
        }
    }
}

impl ArchivewatchConfig {
    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<ResolvedSettings> {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    fn resolve_with_lookup<F>(&self, lookup_env: F) -> Result<ResolvedSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, configured: &Option<String>| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| configured.clone())
        };
        let number = |key: &str| lookup_env(key).and_then(|value| value.trim().parse::<u64>().ok());

        let api_url_setting = text("ARCHIVEWATCH_API_URL", &self.wiki.api_url);
        let wiki_url = text("ARCHIVEWATCH_WIKI_URL", &self.wiki.url)
            .or_else(|| api_url_setting.as_deref().and_then(derive_wiki_url))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let wiki_url = wiki_url.trim_end_matches('/').to_string();
        let api_url = api_url_setting.unwrap_or_else(|| format!("{wiki_url}/w/api.php"));

        let http = HttpSettings {
            user_agent: text("ARCHIVEWATCH_USER_AGENT", &self.wiki.user_agent)
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: number("ARCHIVEWATCH_HTTP_TIMEOUT_MS")
                .or(self.http.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            max_retries: number("ARCHIVEWATCH_HTTP_RETRIES")
                .and_then(|value| usize::try_from(value).ok())
                .or(self.http.retries)
                .unwrap_or(DEFAULT_RETRIES),
            retry_delay_ms: number("ARCHIVEWATCH_HTTP_RETRY_DELAY_MS")
                .or(self.http.retry_delay_ms)
                .unwrap_or(DEFAULT_RETRY_DELAY_MS),
            rate_limit_ms: number("ARCHIVEWATCH_RATE_LIMIT_MS")
                .or(self.http.rate_limit_ms)
                .unwrap_or(DEFAULT_RATE_LIMIT_MS),
        };

        let store_backend = match &self.store.backend {
            Some(value) => StoreBackend::parse(value).context("failed to read [store] backend")?,
            None => StoreBackend::Fs,
        };
        let capacity = |value: Option<usize>| {
            NonZeroUsize::new(value.unwrap_or(DEFAULT_CAPACITY)).unwrap_or(NonZeroUsize::MIN)
        };
        let window = |value: Option<u64>| value.map(Duration::from_secs).unwrap_or(DEFAULT_WINDOW);

        Ok(ResolvedSettings {
            wiki_url,
            api_url,
            namespace: self
                .wiki
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            http,
            store_backend,
            store_dir: self.store.dir.clone(),
            db_path: self.store.db_path.clone(),
            page_capacity: capacity(self.cache.page_capacity),
            page_window: window(self.cache.page_window_secs),
            history_capacity: capacity(self.cache.history_capacity),
            history_window: window(self.cache.history_window_secs),
            translate_endpoint: text("ARCHIVEWATCH_TRANSLATE_ENDPOINT", &self.translate.endpoint),
            translate_api_key: text("ARCHIVEWATCH_TRANSLATE_API_KEY", &self.translate.api_key),
            translate_workers: self.translate.workers.unwrap_or(DEFAULT_WORKERS).max(1),
            translate_chunk_size: self.translate.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1),
        })
    }
}

/// Load and parse the config file. A missing file yields the defaults.
pub fn load_config(config_path: &Path) -> Result<ArchivewatchConfig> {
    if !config_path.exists() {
        return Ok(ArchivewatchConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ArchivewatchConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Derive the wiki base URL from an API URL by stripping `/w/api.php` or `/api.php`.
pub fn derive_wiki_url(api_url: &str) -> Option<String> {
    let trimmed = api_url.trim();
    let stripped = trimmed
        .strip_suffix("/w/api.php")
        .or_else(|| trimmed.strip_suffix("/api.php"))
        .unwrap_or(trimmed);
    let result = stripped.trim_end_matches('/').to_string();
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}
