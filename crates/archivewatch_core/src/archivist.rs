use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::catalog::ArchiveCatalog;
use crate::fetcher::{DocumentFetcher, HistoryEntry};
use crate::history::HistoryLru;
use crate::lru::{DEFAULT_CAPACITY, DEFAULT_WINDOW};
use crate::page::Address;
use crate::store::ObjectStore;
use crate::wikiurl::{absolutize, wiki_href};

pub const DEFAULT_BASE_URL: &str = "https://uk.wikisource.org";
pub const DEFAULT_NAMESPACE: &str = "Архів";

#[derive(Debug, Clone)]
pub struct ArchivistSettings {
    pub base_url: String,
    pub namespace: String,
    pub history_capacity: NonZeroUsize,
    pub history_window: Duration,
}

impl Default for ArchivistSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            history_capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            history_window: DEFAULT_WINDOW,
        }
    }
}

/// Shared context for page operations: where blobs live, how the wiki is
/// reached, and the history cache in front of it.
pub struct Archivist {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn DocumentFetcher>,
    catalog: Arc<ArchiveCatalog>,
    history: HistoryLru,
    base_url: String,
    namespace: String,
}

impl Archivist {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn DocumentFetcher>,
        catalog: Arc<ArchiveCatalog>,
        settings: ArchivistSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            catalog,
            history: HistoryLru::new(settings.history_capacity, settings.history_window),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            namespace: settings.namespace,
        }
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn store_handle(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    pub fn fetcher(&self) -> &dyn DocumentFetcher {
        self.fetcher.as_ref()
    }

    pub fn catalog(&self) -> &ArchiveCatalog {
        &self.catalog
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn wiki_url(&self, title: &str) -> String {
        absolutize(&self.base_url, &wiki_href(title))
    }

    /// `Архів:ДАКО/Д` for `("DAKO", "D")`.
    pub fn archive_title(&self, tag: &str, subarchive: &str) -> Option<String> {
        let name = self.catalog.archive_name(tag)?;
        let subarchive = self.catalog.decode_subarchive(subarchive);
        Some(format!("{}:{}/{}", self.namespace, name, subarchive.uk))
    }

    /// Wiki title of any address, derived from the archive title.
    pub fn address_title(&self, address: &Address) -> Option<String> {
        let mut title = self.archive_title(&address.archive, &address.subarchive)?;
        for segment in address.segments() {
            title.push('/');
            title.push_str(segment);
        }
        Some(title)
    }

    /// Canonical tag case and English subarchive; unknown tags pass through.
    pub fn canonical_address(&self, address: &Address) -> Address {
        let archive = self
            .catalog
            .archive_tag(&address.archive)
            .unwrap_or(address.archive.as_str());
        let subarchive = &self.catalog.decode_subarchive(&address.subarchive).en;
        Address::from_segments(archive, subarchive, &address.segments())
    }

    pub fn history(&self, title: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.history.lookup(self.fetcher(), title, limit)
    }

    pub fn history_head(&self, title: &str) -> Result<Option<HistoryEntry>> {
        self.history.head(self.fetcher(), title)
    }

    pub fn fresh_history_head(&self, title: &str) -> Result<Option<HistoryEntry>> {
        self.history.refresh_head(self.fetcher(), title)
    }

    pub fn history_since(&self, title: &str, cutoff: &str) -> Result<Vec<HistoryEntry>> {
        self.history.lookup_by_cutoff(self.fetcher(), title, cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFetcher, archivist_with};

    #[test]
    fn titles_follow_the_catalog() {
        let ctx = archivist_with(Arc::new(MockFetcher::default()));
        assert_eq!(ctx.archive_title("DAKO", "D").as_deref(), Some("Архів:ДАКО/Д"));
        assert_eq!(ctx.archive_title("NOPE", "D"), None);
        let address = Address::new("dako", "Р", Some("1455"), Some("1"), None);
        assert_eq!(
            ctx.address_title(&address).as_deref(),
            Some("Архів:ДАКО/Р/1455/1")
        );
        assert_eq!(ctx.canonical_address(&address).path(), "DAKO-R/1455/1");
    }
}
