use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::archivist::Archivist;
use crate::fetcher::{DocumentFetcher, FeedEntry, HistoryEntry};
use crate::navigator::find_row;
use crate::page::{Address, Page};
use crate::store::{ObjectStore, load_object, save_object};
use crate::wikiurl::{normalize_title, title_from_link};

pub const FEED_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub modified: String,
    #[serde(default)]
    pub last_resolved: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawWatcherRecord")]
pub struct WatcherRecord {
    pub archive: String,
    pub subarchive: String,
    pub cutoff_date: String,
    pub last_checked_date: String,
    pub resolved: BTreeMap<String, Vec<ChangeEntry>>,
    pub unresolved: BTreeMap<String, ChangeEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawResolved {
    History(Vec<ChangeEntry>),
    Entry(ChangeEntry),
    Timestamp(String),
}

#[derive(Deserialize)]
struct RawWatcherRecord {
    archive: String,
    subarchive: String,
    cutoff_date: String,
    #[serde(default)]
    last_checked_date: Option<String>,
    #[serde(default)]
    resolved: BTreeMap<String, RawResolved>,
    #[serde(default)]
    unresolved: BTreeMap<String, ChangeEntry>,
}

fn upgrade_key(key: String) -> String {
    if key.contains(',') && !key.contains('/') {
        if let Some(address) = Address::from_legacy_key(&key) {
            return address.path();
        }
    }
    key
}

impl From<RawWatcherRecord> for WatcherRecord {
    fn from(raw: RawWatcherRecord) -> Self {
        let cutoff = raw.cutoff_date;
        let fill = |mut entry: ChangeEntry| {
            if entry.last_resolved.is_empty() {
                entry.last_resolved = cutoff.clone();
            }
            entry
        };
        let resolved = raw
            .resolved
            .into_iter()
            .map(|(key, value)| {
                let history = match value {
                    RawResolved::History(entries) => entries.into_iter().map(fill).collect(),
                    RawResolved::Entry(entry) => vec![fill(entry)],
                    RawResolved::Timestamp(modified) => vec![ChangeEntry {
                        modified,
                        last_resolved: cutoff.clone(),
                    }],
                };
                (upgrade_key(key), history)
            })
            .filter(|(_, history): &(String, Vec<ChangeEntry>)| !history.is_empty())
            .collect();
        let unresolved = raw
            .unresolved
            .into_iter()
            .map(|(key, entry)| (upgrade_key(key), fill(entry)))
            .collect();
        Self {
            archive: raw.archive,
            subarchive: raw.subarchive,
            last_checked_date: raw.last_checked_date.unwrap_or_default(),
            resolved,
            unresolved,
            cutoff_date: cutoff,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub observed: usize,
    pub newly_unresolved: usize,
    pub ancestors_checked: bool,
    pub last_checked_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedNode {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<UnresolvedNode>,
}

/// Tracks which addresses of one archive changed since a cutoff and which of
/// those changes a user has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveWatcher {
    record: WatcherRecord,
}

impl ArchiveWatcher {
    pub fn new(archive: &str, subarchive: &str, cutoff_date: &str) -> Self {
        Self {
            record: WatcherRecord {
                archive: archive.to_string(),
                subarchive: subarchive.to_string(),
                cutoff_date: cutoff_date.to_string(),
                last_checked_date: String::new(),
                resolved: BTreeMap::new(),
                unresolved: BTreeMap::new(),
            },
        }
    }

    pub fn from_record(record: WatcherRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &WatcherRecord {
        &self.record
    }

    pub fn archive(&self) -> &str {
        &self.record.archive
    }

    pub fn subarchive(&self) -> &str {
        &self.record.subarchive
    }

    pub fn cutoff_date(&self) -> &str {
        &self.record.cutoff_date
    }

    pub fn last_checked_date(&self) -> Option<&str> {
        Some(self.record.last_checked_date.as_str()).filter(|value| !value.is_empty())
    }

    pub fn resolved(&self) -> &BTreeMap<String, Vec<ChangeEntry>> {
        &self.record.resolved
    }

    pub fn unresolved(&self) -> &BTreeMap<String, ChangeEntry> {
        &self.record.unresolved
    }

    fn window_start(&self) -> &str {
        self.last_checked_date().unwrap_or(&self.record.cutoff_date)
    }

    /// Poll the change feed and fold every change since the window start into
    /// the unresolved set. State is only touched after all remote reads
    /// succeed, so a failed check can simply be retried.
    pub fn check(&mut self, ctx: &Archivist) -> Result<CheckReport> {
        let since = self.window_start().to_string();
        let mut archive = Page::archive(ctx, &self.record.archive, &self.record.subarchive)?;
        let archive_title = archive
            .history_title()
            .with_context(|| format!("archive page {} has no wiki title", archive.name()))?;
        let archive_head = ctx
            .fresh_history_head(&archive_title)?
            .with_context(|| format!("archive page {} has no history", archive.name()))?;
        archive
            .load_head(ctx, &archive_head)
            .with_context(|| format!("failed to load archive page {}", archive.name()))?;

        let feed = collect_change_feed(ctx.fetcher(), &archive_title, &since)?;
        let summary = summarize_changes(&archive, &archive_title, &feed);
        let mut changes = summary.changes;
        let ancestors_checked =
            correct_ancestors(ctx, &archive, &archive_head, &archive_title, &since, &mut changes)?;

        let mut newly_unresolved = 0;
        for (key, modified) in &changes {
            if self.record_change(key, modified) {
                newly_unresolved += 1;
            }
        }
        let mut advance_to = changes.values().max().cloned();
        if let Some(held) = summary.held_back {
            debug!(archive = %archive.name(), held = %held, "window held back at change under unlisted fond");
            advance_to = advance_to.map(|latest| latest.min(held));
        }
        if let Some(latest) = advance_to
            && latest.as_str() > self.record.last_checked_date.as_str()
        {
            self.record.last_checked_date = latest;
        }

        let report = CheckReport {
            observed: changes.len(),
            newly_unresolved,
            ancestors_checked,
            last_checked_date: self.record.last_checked_date.clone(),
        };
        info!(
            archive = %archive.name(),
            since = %since,
            observed = report.observed,
            newly_unresolved = report.newly_unresolved,
            unresolved = self.record.unresolved.len(),
            "watcher check finished"
        );
        Ok(report)
    }

    fn record_change(&mut self, key: &str, modified: &str) -> bool {
        let last_resolved = self
            .record
            .resolved
            .get(key)
            .and_then(|history| history.last())
            .map(|entry| entry.modified.clone());
        if let Some(last) = &last_resolved
            && modified <= last.as_str()
        {
            return false;
        }
        if let Some(existing) = self.record.unresolved.get(key)
            && existing.modified.as_str() >= modified
        {
            return false;
        }
        self.record.unresolved.insert(
            key.to_string(),
            ChangeEntry {
                modified: modified.to_string(),
                last_resolved: last_resolved.unwrap_or_else(|| self.record.cutoff_date.clone()),
            },
        );
        true
    }

    /// Move `key` (and with `deep`, every key below it) from unresolved to
    /// resolved. Returns how many entries moved; absent keys are a no-op.
    pub fn resolve(&mut self, key: &str, deep: bool) -> usize {
        let key = key.trim_end_matches('/');
        let subtree = format!("{key}/");
        let targets = self
            .record
            .unresolved
            .keys()
            .filter(|candidate| *candidate == key || (deep && candidate.starts_with(&subtree)))
            .cloned()
            .collect::<Vec<_>>();
        for target in &targets {
            if let Some(entry) = self.record.unresolved.remove(target) {
                self.record
                    .resolved
                    .entry(target.clone())
                    .or_default()
                    .push(entry);
            }
        }
        targets.len()
    }

    /// Undo the most recent resolution of `key`. Returns false when there is
    /// nothing to undo or a newer change is already pending.
    pub fn unresolve(&mut self, key: &str) -> bool {
        if self.record.unresolved.contains_key(key) {
            return false;
        }
        let Some(history) = self.record.resolved.get_mut(key) else {
            return false;
        };
        let Some(entry) = history.pop() else {
            return false;
        };
        if history.is_empty() {
            self.record.resolved.remove(key);
        }
        self.record.unresolved.insert(key.to_string(), entry);
        true
    }

    pub fn unresolved_tree(&self) -> Vec<UnresolvedNode> {
        #[derive(Default)]
        struct Builder {
            change: Option<ChangeEntry>,
            children: BTreeMap<String, Builder>,
        }

        fn finish(prefix: &str, children: BTreeMap<String, Builder>) -> Vec<UnresolvedNode> {
            let mut nodes = children
                .into_iter()
                .map(|(name, builder)| {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}/{name}")
                    };
                    UnresolvedNode {
                        children: finish(&path, builder.children),
                        change: builder.change,
                        name,
                        path,
                    }
                })
                .collect::<Vec<_>>();
            nodes.sort_by(|left, right| tree_order(&left.name, &right.name));
            nodes
        }

        let mut root = Builder::default();
        for (key, entry) in &self.record.unresolved {
            let mut node = &mut root;
            for segment in key.split('/') {
                node = node.children.entry(segment.to_string()).or_default();
            }
            node.change = Some(entry.clone());
        }
        finish("", root.children)
    }
}

fn trailing_number(name: &str) -> Option<u64> {
    let digits = name
        .bytes()
        .rev()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

fn tree_order(left: &str, right: &str) -> Ordering {
    let rank = |name: &str| trailing_number(name).unwrap_or(u64::MAX);
    rank(left)
        .cmp(&rank(right))
        .then_with(|| left.cmp(right))
}

fn collect_change_feed(
    fetcher: &dyn DocumentFetcher,
    query: &str,
    since: &str,
) -> Result<Vec<FeedEntry>> {
    let mut limit = FEED_PAGE_SIZE;
    let mut previous_len = 0;
    loop {
        let entries = fetcher
            .fetch_change_feed(query, limit, 0)
            .with_context(|| format!("failed to read change feed for {query}"))?;
        let exhausted = entries.len() < limit || entries.len() == previous_len;
        let reached = entries
            .last()
            .is_none_or(|oldest| oldest.lastmod.as_str() < since);
        if exhausted || reached {
            debug!(query, since, limit, entries = entries.len(), "change feed read");
            return Ok(entries
                .into_iter()
                .filter(|entry| entry.lastmod.as_str() >= since)
                .collect());
        }
        previous_len = entries.len();
        limit *= 2;
    }
}

struct FeedSummary {
    changes: BTreeMap<String, String>,
    held_back: Option<String>,
}

/// Map feed entries to address paths within this archive. Entries outside the
/// archive are ignored; entries under fonds the archive does not list are
/// skipped but remembered so the window does not move past them.
fn summarize_changes(archive: &Page, archive_title: &str, feed: &[FeedEntry]) -> FeedSummary {
    let address = archive.address();
    let mut changes: BTreeMap<String, String> = BTreeMap::new();
    let mut held_back: Option<String> = None;
    for entry in feed {
        let title = title_from_link(&entry.link).unwrap_or_else(|| normalize_title(&entry.title));
        let segments = if title == archive_title {
            Vec::new()
        } else {
            let Some(rest) = title.strip_prefix(archive_title).and_then(|rest| rest.strip_prefix('/'))
            else {
                continue;
            };
            rest.split('/').map(str::trim).collect::<Vec<_>>()
        };
        if let Some(fond) = segments.first()
            && find_row(archive.rows(), fond).is_none()
        {
            debug!(title = %title, "skipping change under unlisted fond");
            if held_back.as_ref().is_none_or(|held| entry.lastmod < *held) {
                held_back = Some(entry.lastmod.clone());
            }
            continue;
        }
        let key = Address::from_segments(&address.archive, &address.subarchive, &segments).path();
        let slot = changes.entry(key).or_default();
        if entry.lastmod > *slot {
            *slot = entry.lastmod.clone();
        }
    }
    FeedSummary { changes, held_back }
}

/// The feed can miss edits to intermediate pages. When the archive page itself
/// moved within the window, check the history head of every fond and opus
/// above a changed address. This is a heuristic: changes that leave the
/// archive page untouched are not re-checked. Heads are read past the cache.
fn correct_ancestors(
    ctx: &Archivist,
    archive: &Page,
    archive_head: &HistoryEntry,
    archive_title: &str,
    since: &str,
    changes: &mut BTreeMap<String, String>,
) -> Result<bool> {
    if archive_head.modified.as_str() <= since {
        debug!(archive = %archive.name(), since, "archive unchanged in window, ancestor checks skipped; nested edits missing from the feed would go unnoticed");
        return Ok(false);
    }
    let slot = changes.entry(archive.name()).or_default();
    if archive_head.modified > *slot {
        *slot = archive_head.modified.clone();
    }

    let ancestors = changes
        .keys()
        .filter_map(|key| Address::parse_path(key))
        .flat_map(|address| address.ancestors())
        .filter(|address| !address.segments().is_empty())
        .collect::<BTreeSet<_>>();
    for ancestor in ancestors {
        let title = format!("{archive_title}/{}", ancestor.segments().join("/"));
        let Some(head) = ctx.fresh_history_head(&title)? else {
            continue;
        };
        if head.modified.as_str() >= since {
            let slot = changes.entry(ancestor.path()).or_default();
            if head.modified > *slot {
                *slot = head.modified;
            }
        }
    }
    Ok(true)
}

pub struct WatcherStore {
    store: Arc<dyn ObjectStore>,
    owner: String,
}

impl WatcherStore {
    pub fn new(store: Arc<dyn ObjectStore>, owner: &str) -> Self {
        Self {
            store,
            owner: owner.to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn key(&self, archive: &str, subarchive: &str) -> String {
        format!("watchers/{}/{archive}-{subarchive}.json", self.owner)
    }

    pub fn load(&self, archive: &str, subarchive: &str) -> Result<Option<ArchiveWatcher>> {
        let key = self.key(archive, subarchive);
        match load_object::<WatcherRecord>(self.store.as_ref(), &key) {
            Ok(record) => Ok(Some(ArchiveWatcher::from_record(record))),
            Err(error) if error.is_miss() => Ok(None),
            Err(error) => Err(error).with_context(|| format!("failed to load watcher {key}")),
        }
    }

    pub fn save(&self, watcher: &ArchiveWatcher) -> Result<()> {
        let key = self.key(watcher.archive(), watcher.subarchive());
        save_object(self.store.as_ref(), &key, watcher.record())
    }

    pub fn remove(&self, archive: &str, subarchive: &str) -> Result<()> {
        self.store.delete(&self.key(archive, subarchive))
    }

    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let prefix = format!("watchers/{}/", self.owner);
        let mut watchers = Vec::new();
        for key in self.store.keys(&prefix)? {
            let Some(name) = key
                .strip_prefix(&prefix)
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };
            if let Some((archive, subarchive)) = name.split_once('-') {
                watchers.push((archive.to_string(), subarchive.to_string()));
            }
        }
        Ok(watchers)
    }
}
