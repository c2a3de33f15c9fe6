use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archivist::Archivist;
use crate::fetcher::HistoryEntry;
use crate::history;
use crate::lru::PageKey;
use crate::snapshot::{Cell, Snapshot};
use crate::store::{load_object, save_object};
use crate::translate::{ProgressCallback, TranslationQueue, TranslationTask, Translator};
use crate::wikiurl::{absolutize, is_live_link, title_from_link};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Archive,
    Fond,
    Opus,
    Case,
}

struct KindInfo {
    label: &'static str,
    child: Option<PageKind>,
    has_document_link: bool,
}

const KIND_TABLE: [KindInfo; 4] = [
    KindInfo {
        label: "archive",
        child: Some(PageKind::Fond),
        has_document_link: false,
    },
    KindInfo {
        label: "fond",
        child: Some(PageKind::Opus),
        has_document_link: false,
    },
    KindInfo {
        label: "opus",
        child: Some(PageKind::Case),
        has_document_link: false,
    },
    KindInfo {
        label: "case",
        child: None,
        has_document_link: true,
    },
];

impl PageKind {
    fn info(self) -> &'static KindInfo {
        &KIND_TABLE[self.depth()]
    }

    pub fn depth(self) -> usize {
        match self {
            Self::Archive => 0,
            Self::Fond => 1,
            Self::Opus => 2,
            Self::Case => 3,
        }
    }

    pub fn label(self) -> &'static str {
        self.info().label
    }

    pub fn child_kind(self) -> Option<PageKind> {
        self.info().child
    }

    pub fn has_document_link(self) -> bool {
        self.info().has_document_link
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Location of a node: archive and subarchive plus up to three catalogue levels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub archive: String,
    pub subarchive: String,
    pub fond: Option<String>,
    pub opus: Option<String>,
    pub case: Option<String>,
}

fn level(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl Address {
    pub fn archive(archive: &str, subarchive: &str) -> Self {
        Self::new(archive, subarchive, None, None, None)
    }

    pub fn new(
        archive: &str,
        subarchive: &str,
        fond: Option<&str>,
        opus: Option<&str>,
        case: Option<&str>,
    ) -> Self {
        let fond = level(fond);
        let opus = fond.as_ref().and(level(opus));
        let case = opus.as_ref().and(level(case));
        Self {
            archive: archive.trim().to_string(),
            subarchive: subarchive.trim().to_string(),
            fond,
            opus,
            case,
        }
    }

    /// Build from catalogue segments below the archive; anything past case level
    /// is dropped.
    pub fn from_segments(archive: &str, subarchive: &str, segments: &[&str]) -> Self {
        Self::new(
            archive,
            subarchive,
            segments.first().copied(),
            segments.get(1).copied(),
            segments.get(2).copied(),
        )
    }

    pub fn parse_path(path: &str) -> Option<Self> {
        let mut parts = path.trim().trim_matches('/').split('/');
        let (archive, subarchive) = parts.next()?.split_once('-')?;
        if archive.is_empty() || subarchive.is_empty() {
            return None;
        }
        let segments = parts.collect::<Vec<_>>();
        if segments.len() > 3 || segments.iter().any(|segment| segment.trim().is_empty()) {
            return None;
        }
        Some(Self::from_segments(archive, subarchive, &segments))
    }

    /// Parse the comma-joined keys older watcher records used (`DAKO,D,1455,,`).
    pub fn from_legacy_key(key: &str) -> Option<Self> {
        let parts = key.split(',').map(str::trim).collect::<Vec<_>>();
        let archive = parts.first().filter(|value| !value.is_empty())?;
        let subarchive = parts.get(1).filter(|value| !value.is_empty())?;
        let segments = parts[2..]
            .iter()
            .copied()
            .take_while(|value| !value.is_empty())
            .collect::<Vec<_>>();
        Some(Self::from_segments(archive, subarchive, &segments))
    }

    pub fn segments(&self) -> Vec<&str> {
        [&self.fond, &self.opus, &self.case]
            .into_iter()
            .map_while(|value| value.as_deref())
            .collect()
    }

    pub fn kind(&self) -> PageKind {
        match self.segments().len() {
            0 => PageKind::Archive,
            1 => PageKind::Fond,
            2 => PageKind::Opus,
            _ => PageKind::Case,
        }
    }

    pub fn id(&self) -> &str {
        self.segments()
            .last()
            .copied()
            .unwrap_or(self.archive.as_str())
    }

    pub fn parent(&self) -> Option<Self> {
        let segments = self.segments();
        let (_, rest) = segments.split_last()?;
        Some(Self::from_segments(&self.archive, &self.subarchive, rest))
    }

    pub fn child(&self, id: &str) -> Option<Self> {
        let mut segments = self.segments();
        if segments.len() >= 3 || id.trim().is_empty() {
            return None;
        }
        segments.push(id);
        Some(Self::from_segments(&self.archive, &self.subarchive, &segments))
    }

    pub fn ancestors(&self) -> Vec<Self> {
        let mut chain = Vec::new();
        let mut current = self.parent();
        while let Some(address) = current {
            current = address.parent();
            chain.push(address);
        }
        chain.reverse();
        chain
    }

    pub fn path(&self) -> String {
        let mut path = format!("{}-{}", self.archive, self.subarchive);
        for segment in self.segments() {
            path.push('/');
            path.push_str(segment);
        }
        path
    }

    pub fn cache_key(&self) -> PageKey {
        let level = |value: &Option<String>| value.clone().unwrap_or_default();
        [
            self.archive.clone(),
            self.subarchive.clone(),
            level(&self.fond),
            level(&self.opus),
            level(&self.case),
        ]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// What a page knows about its parent: enough to compose addresses and URLs,
/// never a live page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub address: Address,
    pub default_url: Option<String>,
    pub parent: Option<Arc<ParentLink>>,
}

#[derive(Debug, Clone)]
pub struct Page {
    address: Address,
    default_url: Option<String>,
    parent: Option<Arc<ParentLink>>,
    snapshot: Option<Arc<Snapshot>>,
}

impl Page {
    pub fn archive(ctx: &Archivist, tag: &str, subarchive: &str) -> Result<Self> {
        let Some(tag) = ctx.catalog().archive_tag(tag) else {
            bail!("unknown archive tag: {tag}");
        };
        let subarchive = ctx.catalog().decode_subarchive(subarchive).en.clone();
        let default_url = ctx
            .archive_title(tag, &subarchive)
            .map(|title| ctx.wiki_url(&title));
        Ok(Self {
            address: Address::archive(tag, &subarchive),
            default_url,
            parent: None,
            snapshot: None,
        })
    }

    pub(crate) fn under(
        ctx: &Archivist,
        parent: Option<Arc<ParentLink>>,
        address: Address,
        link: Option<&str>,
    ) -> Self {
        let default_url = link
            .filter(|link| is_live_link(link))
            .map(|link| absolutize(ctx.base_url(), link));
        Self {
            address,
            default_url,
            parent,
            snapshot: None,
        }
    }

    pub(crate) fn with_default_url(mut self, url: Option<String>) -> Self {
        self.default_url = url;
        self
    }

    pub fn as_parent_link(&self) -> Arc<ParentLink> {
        Arc::new(ParentLink {
            address: self.address.clone(),
            default_url: self.default_url.clone(),
            parent: self.parent.clone(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_deref()
    }

    pub(crate) fn parent_handle(&self) -> Option<Arc<ParentLink>> {
        self.parent.clone()
    }

    pub fn kind(&self) -> PageKind {
        self.address.kind()
    }

    pub fn name(&self) -> String {
        self.address.path()
    }

    pub fn id(&self) -> &str {
        self.address.id()
    }

    pub fn default_url(&self) -> Option<&str> {
        self.default_url.as_deref()
    }

    /// URL of the loaded version, else the default URL.
    pub fn url(&self) -> Option<&str> {
        self.snapshot
            .as_deref()
            .map(|snapshot| snapshot.link.as_str())
            .filter(|link| !link.is_empty())
            .or(self.default_url())
    }

    pub fn history_title(&self) -> Option<String> {
        self.default_url.as_deref().and_then(title_from_link)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_deref()
    }

    pub fn has_content(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn set_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot = Some(Arc::new(snapshot));
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        self.snapshot
            .as_deref()
            .map(|snapshot| snapshot.children.as_slice())
            .unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        self.snapshot
            .as_deref()
            .map(|snapshot| snapshot.title.get_text())
            .unwrap_or_default()
    }

    /// Description with its leading catalogue number removed.
    pub fn description(&self) -> &str {
        let text = self
            .snapshot
            .as_deref()
            .map(|snapshot| snapshot.description.get_text())
            .unwrap_or_default();
        strip_catalogue_number(text)
    }

    pub fn lastmod(&self) -> Option<&str> {
        self.snapshot.as_deref()?.lastmod.as_deref()
    }

    pub fn refmod(&self) -> Option<&str> {
        self.snapshot.as_deref()?.refmod.as_deref()
    }

    pub fn document_link(&self) -> Option<&str> {
        if !self.kind().has_document_link() {
            return None;
        }
        self.snapshot.as_deref()?.doc_link.as_deref()
    }

    pub fn needs_translation(&self) -> bool {
        self.snapshot
            .as_deref()
            .is_some_and(Snapshot::needs_translation)
    }

    pub fn report(&self) -> String {
        format!(
            "{},{},{}",
            self.kind().label(),
            self.name().replace(',', ""),
            self.lastmod().unwrap_or_default()
        )
    }

    pub fn shortname(&self) -> Option<String> {
        match (&self.address.fond, &self.address.opus, self.kind()) {
            (Some(fond), Some(opus), PageKind::Opus) => {
                Some(format!("{} {fond}-{opus}", self.address.archive))
            }
            _ => None,
        }
    }

    pub fn cache_key(&self, version: &str) -> String {
        format!("page_cache/{}/{version}.json", self.name())
    }

    /// Load the newest version: from cache when its history head is stored,
    /// otherwise from the remote wiki. Failures are logged and leave the page
    /// without content.
    pub fn load(&mut self, ctx: &Archivist) -> bool {
        match self.cache_load(ctx, None) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(error) => warn!(page = %self.address, error = %format!("{error:#}"), "cache load failed"),
        }
        let Some(url) = self.default_url.clone() else {
            debug!(page = %self.address, "no default url, page left empty");
            return false;
        };
        match self.fetch_latest(ctx, &url) {
            Ok(()) => true,
            Err(error) => {
                warn!(page = %self.address, %url, error = %format!("{error:#}"), "failed to load page");
                false
            }
        }
    }

    pub fn load_head(&mut self, ctx: &Archivist, head: &HistoryEntry) -> Result<()> {
        if self.cache_load(ctx, Some(&head.modified))? {
            return Ok(());
        }
        let Some(url) = self.default_url.clone() else {
            bail!("{} has no wiki url", self.address);
        };
        self.fetch_current(ctx, &url, Some(head.modified.clone()))
    }

    fn fetch_latest(&mut self, ctx: &Archivist, url: &str) -> Result<()> {
        let lastmod = match self.history_title() {
            Some(title) => ctx.history_head(&title)?.map(|head| head.modified),
            None => None,
        };
        self.fetch_current(ctx, url, lastmod)
    }

    fn fetch_current(&mut self, ctx: &Archivist, url: &str, lastmod: Option<String>) -> Result<()> {
        info!(page = %self.address, %url, "fetching page from wiki");
        let mut snapshot = ctx
            .fetcher()
            .fetch_snapshot(url)
            .with_context(|| format!("failed to fetch {url}"))?;
        if lastmod.is_some() {
            snapshot.lastmod = lastmod;
        }
        self.snapshot = Some(Arc::new(snapshot));
        if let Err(error) = self.cache_save(ctx) {
            warn!(page = %self.address, error = %format!("{error:#}"), "failed to cache page");
        }
        Ok(())
    }

    /// Load a stored version. Without `version` the history head is used.
    /// A cache miss returns `Ok(false)`.
    pub fn cache_load(&mut self, ctx: &Archivist, version: Option<&str>) -> Result<bool> {
        let version = match version {
            Some(version) => version.to_string(),
            None => {
                let Some(title) = self.history_title() else {
                    return Ok(false);
                };
                match ctx.history_head(&title)? {
                    Some(head) => head.modified,
                    None => return Ok(false),
                }
            }
        };
        let key = self.cache_key(&version);
        match load_object::<Snapshot>(ctx.store(), &key) {
            Ok(snapshot) => {
                debug!(page = %self.address, %key, "loaded page from cache");
                self.snapshot = Some(Arc::new(snapshot));
                Ok(true)
            }
            Err(error) if error.is_miss() => {
                debug!(page = %self.address, %key, "page cache miss");
                Ok(false)
            }
            Err(error) => Err(error).with_context(|| format!("failed to load cached page {key}")),
        }
    }

    pub fn cache_load_local(&mut self, ctx: &Archivist) -> Result<bool> {
        let prefix = format!("page_cache/{}/", self.name());
        let keys = ctx.store().keys(&prefix)?;
        let newest = keys
            .iter()
            .filter(|key| !key[prefix.len()..].contains('/'))
            .max();
        let Some(key) = newest else {
            return Ok(false);
        };
        let snapshot = load_object::<Snapshot>(ctx.store(), key)
            .with_context(|| format!("failed to load cached page {key}"))?;
        self.snapshot = Some(Arc::new(snapshot));
        Ok(true)
    }

    /// Persist the current snapshot under its lastmod. Snapshots without a
    /// lastmod are skipped; comparison snapshots are refused.
    pub fn cache_save(&self, ctx: &Archivist) -> Result<bool> {
        let Some(snapshot) = self.snapshot.as_deref() else {
            return Ok(false);
        };
        if let Some(refmod) = &snapshot.refmod {
            bail!(
                "refusing to cache {} while it is compared against {refmod}",
                self.address
            );
        }
        let Some(lastmod) = &snapshot.lastmod else {
            debug!(page = %self.address, "snapshot has no lastmod, not cached");
            return Ok(false);
        };
        save_object(ctx.store(), &self.cache_key(lastmod), snapshot)?;
        Ok(true)
    }

    pub fn latest(&mut self, ctx: &Archivist) -> Result<bool> {
        self.cache_load(ctx, None)
    }

    pub fn is_latest(&self, ctx: &Archivist) -> Result<bool> {
        let Some(title) = self.history_title() else {
            return Ok(true);
        };
        let head = ctx.history_head(&title)?;
        Ok(head.map(|entry| entry.modified).as_deref() == self.lastmod())
    }

    pub fn history(&self, ctx: &Archivist, limit: usize) -> Result<Vec<HistoryEntry>> {
        match self.history_title() {
            Some(title) => ctx.history(&title, limit),
            None => Ok(Vec::new()),
        }
    }

    pub fn history_since(&self, ctx: &Archivist, cutoff: &str) -> Result<Vec<HistoryEntry>> {
        match self.history_title() {
            Some(title) => ctx.history_since(&title, cutoff),
            None => Ok(Vec::new()),
        }
    }

    /// Switch to the newest version at or before `date`. Returns `Ok(false)`
    /// and leaves the page unchanged when no such version exists.
    pub fn revert_to(&mut self, ctx: &Archivist, date: &str) -> Result<bool> {
        let history = self.history_since(ctx, date)?;
        let Some(version) = history::version_at(&history, date).cloned() else {
            info!(page = %self.address, date, "no version at or before date");
            return Ok(false);
        };
        if self.cache_load(ctx, Some(&version.modified))? {
            return Ok(true);
        }
        info!(page = %self.address, version = %version.modified, "fetching historical version");
        let mut snapshot = ctx
            .fetcher()
            .fetch_snapshot(&version.link)
            .with_context(|| format!("failed to fetch {}", version.link))?;
        snapshot.lastmod = Some(version.modified);
        self.snapshot = Some(Arc::new(snapshot));
        self.cache_save(ctx)?;
        Ok(true)
    }

    pub fn compare_with(&self, ctx: &Archivist, date: &str) -> Result<Option<Page>> {
        let Some(current) = self.snapshot.as_deref() else {
            return Ok(None);
        };
        let mut reference = self.clone();
        if !reference.revert_to(ctx, date)? {
            return Ok(None);
        }
        let Some(previous) = reference.snapshot() else {
            return Ok(None);
        };
        let mut annotated = self.clone();
        annotated.snapshot = Some(Arc::new(current.compared_with(previous)));
        Ok(Some(annotated))
    }

    pub fn translate(&mut self, ctx: &Archivist, translator: &dyn Translator) -> Result<usize> {
        let Some(snapshot) = self.snapshot.as_deref() else {
            return Ok(0);
        };
        if snapshot.refmod.is_some() {
            bail!("cannot translate {} while it is in comparison state", self.address);
        }
        let pending = snapshot.untranslated();
        if pending.is_empty() {
            return Ok(0);
        }
        info!(page = %self.address, items = pending.len(), "translating page");
        let translations = translator
            .translate_batch(&pending)
            .with_context(|| format!("failed to translate {}", self.address))?;
        if translations.len() != pending.len() {
            bail!(
                "translator returned {} strings for {} inputs",
                translations.len(),
                pending.len()
            );
        }
        let mut updated = snapshot.clone();
        let applied = updated.apply_translations(&translations);
        self.snapshot = Some(Arc::new(updated));
        self.cache_save(ctx)?;
        Ok(applied)
    }

    /// Queue translation on the worker pool. The task's continuation writes the
    /// translated copy to the store; wait on the task and pass the snapshot to
    /// [`Page::set_snapshot`] to adopt it. `None` when nothing needs translating.
    pub fn translate_async(
        &self,
        ctx: &Archivist,
        queue: &TranslationQueue,
        progress: Option<ProgressCallback>,
    ) -> Result<Option<TranslationTask<Snapshot>>> {
        let Some(snapshot) = self.snapshot.clone() else {
            return Ok(None);
        };
        if snapshot.refmod.is_some() {
            bail!("cannot translate {} while it is in comparison state", self.address);
        }
        let pending = snapshot.untranslated();
        if pending.is_empty() {
            return Ok(None);
        }
        let store = ctx.store_handle();
        let key = snapshot.lastmod.as_deref().map(|lastmod| self.cache_key(lastmod));
        let page = self.name();
        let task = queue.queue_with_result(pending, progress, move |outcome| {
            let mut updated = Snapshot::clone(&snapshot);
            let applied = updated.apply_translations(&outcome.texts);
            if let Some(key) = &key {
                save_object(store.as_ref(), key, &updated)?;
            }
            info!(page = %page, applied, cancelled = outcome.cancelled, "stored translated page");
            Ok(updated)
        })?;
        Ok(Some(task))
    }
}

fn strip_catalogue_number(text: &str) -> &str {
    let digits = text.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return text;
    }
    let mut rest = &text[digits..];
    if let Some(next) = rest.chars().next() {
        rest = &rest[next.len_utf8()..];
    }
    rest.trim_start_matches(' ')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;
    use crate::testing::{BASE_URL, MockFetcher, archivist_with, fond_fixture, snapshot_with_rows};
    use crate::text::TextItem;
    use crate::wikiurl::wiki_href;
    use pretty_assertions::assert_eq;

    #[test]
    fn addresses_render_and_parse_paths() {
        let address = Address::new("DAKO", "D", Some("1455"), Some("1"), Some("169"));
        assert_eq!(address.path(), "DAKO-D/1455/1/169");
        assert_eq!(address.kind(), PageKind::Case);
        assert_eq!(address.id(), "169");
        assert_eq!(Address::parse_path("DAKO-D/1455/1/169"), Some(address.clone()));
        assert_eq!(
            address.parent().map(|parent| parent.path()),
            Some("DAKO-D/1455/1".to_string())
        );
        assert_eq!(
            address.ancestors().iter().map(Address::path).collect::<Vec<_>>(),
            vec!["DAKO-D", "DAKO-D/1455", "DAKO-D/1455/1"]
        );
        assert_eq!(address.child("x"), None);
        assert_eq!(Address::parse_path("DAKO"), None);
    }

    #[test]
    fn gaps_truncate_the_address() {
        let address = Address::new("DAKO", "D", Some("1"), None, Some("9"));
        assert_eq!(address.path(), "DAKO-D/1");
        assert_eq!(address.cache_key()[3], "");
        assert_eq!(
            Address::from_legacy_key("DAKO,D,1455,,"),
            Some(Address::new("DAKO", "D", Some("1455"), None, None))
        );
    }

    #[test]
    fn kind_table_drives_children_and_document_links() {
        assert_eq!(PageKind::Archive.child_kind(), Some(PageKind::Fond));
        assert_eq!(PageKind::Case.child_kind(), None);
        assert!(PageKind::Case.has_document_link());
        assert!(!PageKind::Opus.has_document_link());
        assert_eq!(PageKind::Opus.to_string(), "opus");
    }

    #[test]
    fn archive_page_derives_default_url() {
        let ctx = archivist_with(Arc::new(MockFetcher::default()));
        let page = Page::archive(&ctx, "DAZHO", "Д").expect("archive");
        assert_eq!(page.name(), "DAZHO-D");
        assert_eq!(
            page.default_url(),
            Some(
                "https://uk.wikisource.org/wiki/%D0%90%D1%80%D1%85%D1%96%D0%B2%3A%D0%94%D0%90%D0%96%D0%9E/%D0%94"
            )
        );
        assert_eq!(page.history_title().as_deref(), Some("Архів:ДАЖО/Д"));
        assert!(Page::archive(&ctx, "NOPE", "D").is_err());
    }

    #[test]
    fn cache_miss_falls_through_to_fetch_then_hits_cache() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher.clone());

        let mut first = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(first.load(&ctx));
        assert_eq!(first.lastmod(), Some("2025,03,02,10:00"));
        assert_eq!(fetcher.snapshot_calls().len(), 1);

        let mut second = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(second.load(&ctx));
        assert_eq!(second.snapshot(), first.snapshot());
        assert_eq!(fetcher.snapshot_calls().len(), 1);
        assert!(second.is_latest(&ctx).expect("is latest"));
        assert_eq!(second.report(), "archive,DAKO-D,2025,03,02,10:00");
    }

    #[test]
    fn failed_fetch_leaves_page_empty() {
        let ctx = archivist_with(Arc::new(MockFetcher::default()));
        let mut page = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(!page.load(&ctx));
        assert!(!page.has_content());
        assert_eq!(page.title(), "");
        assert!(page.rows().is_empty());
    }

    #[test]
    fn revert_to_picks_newest_version_not_after_date() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher.clone());
        let mut page = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(page.load(&ctx));

        assert!(page.revert_to(&ctx, "2025,02,15").expect("revert"));
        assert_eq!(page.lastmod(), Some("2025,02,01,09:00"));
        assert_eq!(page.rows().len(), 1);
        assert!(ctx.store().get(&page.cache_key("2025,02,01,09:00")).is_ok());

        assert!(!page.revert_to(&ctx, "2020,01,01").expect("revert"));
        assert_eq!(page.lastmod(), Some("2025,02,01,09:00"));

        assert!(page.latest(&ctx).expect("latest"));
        assert_eq!(page.lastmod(), Some("2025,03,02,10:00"));
    }

    #[test]
    fn comparison_state_refuses_cache_save() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher);
        let mut page = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(page.load(&ctx));

        let compared = page
            .compare_with(&ctx, "2025,02,15")
            .expect("compare")
            .expect("reference exists");
        assert_eq!(compared.refmod(), Some("2025,02,01,09:00"));
        assert!(compared.cache_save(&ctx).is_err());
        let report = compared
            .snapshot()
            .and_then(Snapshot::change_report)
            .expect("report");
        assert!(report.contains("[added] 1500"));
    }

    struct Upper;

    impl Translator for Upper {
        fn translate_batch(&self, texts: &[String]) -> Result<Vec<String>> {
            Ok(texts.iter().map(|text| format!("EN:{text}")).collect())
        }
    }

    #[test]
    fn translate_fills_pending_items_and_persists() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher);
        let mut page = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(page.load(&ctx));
        assert!(page.needs_translation());

        let applied = page.translate(&ctx, &Upper).expect("translate");
        assert!(applied > 0);
        assert!(!page.needs_translation());

        let mut reloaded = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(reloaded.cache_load(&ctx, None).expect("cache"));
        assert_eq!(reloaded.snapshot(), page.snapshot());
        assert_eq!(page.translate(&ctx, &Upper).expect("noop"), 0);
    }

    #[test]
    fn translate_async_writes_through_continuation() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher);
        let mut page = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(page.load(&ctx));

        let queue = TranslationQueue::new(Arc::new(Upper), 1, 2);
        let task = page
            .translate_async(&ctx, &queue, None)
            .expect("queue")
            .expect("pending items");
        let translated = task.wait().expect("translated");
        assert!(!translated.needs_translation());
        page.set_snapshot(translated);

        let mut reloaded = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(reloaded.cache_load(&ctx, None).expect("cache"));
        assert!(!reloaded.needs_translation());
    }

    #[test]
    fn local_cache_load_uses_newest_stored_version() {
        let fetcher = Arc::new(MockFetcher::default());
        let ctx = archivist_with(fetcher);
        let mut page = Page::archive(&ctx, "DAKO", "D").expect("archive");
        for lastmod in ["2024,01,01,00:00", "2024,06,01,00:00"] {
            let mut snapshot = snapshot_with_rows("ДАКО/Д", &[]);
            snapshot.lastmod = Some(lastmod.to_string());
            page.set_snapshot(snapshot);
            page.cache_save(&ctx).expect("save");
        }
        ctx.store()
            .put(
                "page_cache/DAKO-D/1455/2030,01,01,00:00.json",
                &serde_json::json!({"title": {"uk": "child"}}),
            )
            .expect("put child");

        let mut fresh = Page::archive(&ctx, "DAKO", "D").expect("archive");
        assert!(fresh.cache_load_local(&ctx).expect("local"));
        assert_eq!(fresh.lastmod(), Some("2024,06,01,00:00"));
        let expected = format!("{BASE_URL}{}", wiki_href("ДАКО/Д"));
        assert_eq!(fresh.url(), Some(expected.as_str()));
    }

    #[test]
    fn derived_text_properties() {
        assert_eq!(strip_catalogue_number("12. Опис справ"), "Опис справ");
        assert_eq!(strip_catalogue_number("Опис"), "Опис");
        let ctx = archivist_with(Arc::new(MockFetcher::default()));
        let archive = Page::archive(&ctx, "DAKO", "D").expect("archive");
        let opus = Page::under(
            &ctx,
            Some(archive.as_parent_link()),
            Address::new("DAKO", "D", Some("1455"), Some("1"), None),
            Some("/wiki/A"),
        );
        assert_eq!(opus.shortname().as_deref(), Some("DAKO 1455-1"));
        assert_eq!(opus.default_url(), Some("https://uk.wikisource.org/wiki/A"));
        let mut case = Page::under(
            &ctx,
            None,
            Address::new("DAKO", "D", Some("1"), Some("2"), Some("3")),
            None,
        );
        let mut snapshot = snapshot_with_rows("c", &[]);
        snapshot.doc_link = Some("/wiki/File:x.pdf".to_string());
        snapshot.description = TextItem::from_source("3 справа");
        case.set_snapshot(snapshot);
        assert_eq!(case.document_link(), Some("/wiki/File:x.pdf"));
        assert_eq!(case.description(), "справа");
        assert_eq!(case.default_url(), None);
    }
}
