//! In-memory fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::archivist::{Archivist, ArchivistSettings};
use crate::catalog::ArchiveCatalog;
use crate::fetcher::{DocumentFetcher, FeedEntry, HistoryEntry};
use crate::snapshot::{Cell, Snapshot};
use crate::store::MemoryObjectStore;
use crate::text::TextItem;
use crate::wikiurl::wiki_href;

pub const BASE_URL: &str = "https://uk.wikisource.org";

#[derive(Default)]
pub struct MockFetcher {
    pages: Mutex<HashMap<String, Snapshot>>,
    histories: Mutex<HashMap<String, Vec<HistoryEntry>>>,
    feed: Mutex<Vec<FeedEntry>>,
    snapshot_calls: Mutex<Vec<String>>,
    history_limits: Mutex<Vec<usize>>,
    feed_calls: AtomicUsize,
    fail_feed: AtomicBool,
}

impl MockFetcher {
    pub fn add_page(&self, url: &str, snapshot: Snapshot) {
        self.pages
            .lock()
            .expect("pages lock")
            .insert(url.to_string(), snapshot);
    }

    pub fn add_history(&self, title: &str, entries: Vec<HistoryEntry>) {
        self.histories
            .lock()
            .expect("histories lock")
            .insert(title.to_string(), entries);
    }

    /// Register the current version of `title` with a one-entry history.
    pub fn add_current(&self, title: &str, lastmod: &str, snapshot: Snapshot) {
        let url = page_url(title);
        self.add_page(&url, snapshot);
        self.add_history(title, vec![HistoryEntry::new(lastmod, &url)]);
    }

    pub fn push_feed(&self, title: &str, lastmod: &str) {
        let mut feed = self.feed.lock().expect("feed lock");
        feed.push(FeedEntry {
            title: title.to_string(),
            link: wiki_href(title),
            lastmod: lastmod.to_string(),
        });
        feed.sort_by(|left, right| right.lastmod.cmp(&left.lastmod));
    }

    pub fn set_feed_failure(&self, fail: bool) {
        self.fail_feed.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot_calls(&self) -> Vec<String> {
        self.snapshot_calls.lock().expect("calls lock").clone()
    }

    pub fn history_limits(&self) -> Vec<usize> {
        self.history_limits.lock().expect("limits lock").clone()
    }

    pub fn feed_calls(&self) -> usize {
        self.feed_calls.load(Ordering::SeqCst)
    }
}

impl DocumentFetcher for MockFetcher {
    fn fetch_snapshot(&self, url: &str) -> Result<Snapshot> {
        self.snapshot_calls
            .lock()
            .expect("calls lock")
            .push(url.to_string());
        let Some(mut snapshot) = self.pages.lock().expect("pages lock").get(url).cloned() else {
            bail!("no page at {url}");
        };
        snapshot.link = url.to_string();
        Ok(snapshot)
    }

    fn fetch_history(&self, title: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.history_limits.lock().expect("limits lock").push(limit);
        Ok(self
            .histories
            .lock()
            .expect("histories lock")
            .get(title)
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn fetch_change_feed(&self, _query: &str, limit: usize, offset: usize) -> Result<Vec<FeedEntry>> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_feed.load(Ordering::SeqCst) {
            bail!("change feed unavailable");
        }
        Ok(self
            .feed
            .lock()
            .expect("feed lock")
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn request_count(&self) -> usize {
        self.snapshot_calls().len() + self.history_limits().len() + self.feed_calls()
    }
}

pub fn page_url(title: &str) -> String {
    format!("{BASE_URL}{}", wiki_href(title))
}

pub fn archivist_with(fetcher: Arc<MockFetcher>) -> Archivist {
    Archivist::new(
        Arc::new(MemoryObjectStore::new()),
        fetcher,
        Arc::new(ArchiveCatalog::embedded().expect("catalog")),
        ArchivistSettings::default(),
    )
}

/// A snapshot of `title` whose rows are `(id, child title)` pairs.
pub fn snapshot_with_rows(title: &str, rows: &[(&str, &str)]) -> Snapshot {
    Snapshot {
        title: TextItem::from_source(title),
        description: TextItem::from_source("Опис фондів"),
        header: vec![TextItem::from_source("Фонд"), TextItem::from_source("Назва")],
        children: rows
            .iter()
            .map(|(id, child)| {
                vec![
                    Cell::new(id, Some(wiki_href(child).as_str())),
                    Cell::new("назва", None),
                ]
            })
            .collect(),
        link: page_url(title),
        ..Snapshot::default()
    }
}

pub const DAKO: &str = "Архів:ДАКО/Д";

/// DAKO-D with fonds 1455 and 1500, opus 1455/1 and case 1455/1/169.
/// The archive also has an older revision that lists only fond 1455.
pub fn fond_fixture(fetcher: &MockFetcher) {
    let fond = format!("{DAKO}/1455");
    let opus = format!("{DAKO}/1455/1");
    let case = format!("{DAKO}/1455/1/169");
    let other_fond = format!("{DAKO}/1500");

    let archive_url = page_url(DAKO);
    let old_url = format!("{BASE_URL}/w/index.php?title=Архів:ДАКО/Д&oldid=100");
    fetcher.add_page(
        &archive_url,
        snapshot_with_rows(DAKO, &[("1455", fond.as_str()), ("1500", other_fond.as_str())]),
    );
    fetcher.add_page(&old_url, snapshot_with_rows(DAKO, &[("1455", fond.as_str())]));
    fetcher.add_history(
        DAKO,
        vec![
            HistoryEntry::new("2025,03,02,10:00", &archive_url),
            HistoryEntry::new("2025,02,01,09:00", &old_url),
        ],
    );

    fetcher.add_current(&fond, "2025,03,01,08:00", snapshot_with_rows(&fond, &[("1", opus.as_str())]));
    fetcher.add_current(&opus, "2025,03,03,12:00", snapshot_with_rows(&opus, &[("169", case.as_str())]));
    fetcher.add_current(&case, "2025,03,03,12:00", snapshot_with_rows(&case, &[]));
}
