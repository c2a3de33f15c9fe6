use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::fetcher::{DocumentFetcher, HistoryEntry};
use crate::lru::WindowedLru;

pub const HISTORY_PAGE_SIZE: usize = 50;

/// Fetch history with a doubling page size until it reaches `cutoff` or the
/// page's creation. The result runs newest first through the first entry at or
/// before `cutoff`; if the page is younger than `cutoff` the whole history is
/// returned with the oldest entry marked `created`.
pub fn history_from_cutoff<F: DocumentFetcher + ?Sized>(
    fetcher: &F,
    title: &str,
    cutoff: &str,
) -> Result<Vec<HistoryEntry>> {
    let mut limit = HISTORY_PAGE_SIZE;
    let mut previous_len = 0;
    loop {
        let mut history = fetcher.fetch_history(title, limit)?;
        if history.is_empty() {
            warn!(title, "page has no revision history");
            return Ok(history);
        }
        let exhausted = history.len() == previous_len || history.len() < limit;
        if exhausted && let Some(oldest) = history.last_mut() {
            oldest.created = true;
        }
        let reached = history
            .last()
            .is_some_and(|oldest| oldest.modified.as_str() <= cutoff);
        if reached || exhausted {
            debug!(title, cutoff, limit, entries = history.len(), "history search finished");
            return Ok(through_cutoff(history, cutoff));
        }
        previous_len = history.len();
        limit *= 2;
    }
}

fn cutoff_index(history: &[HistoryEntry], cutoff: &str) -> Option<usize> {
    history
        .iter()
        .position(|entry| entry.modified.as_str() <= cutoff)
}

fn through_cutoff(mut history: Vec<HistoryEntry>, cutoff: &str) -> Vec<HistoryEntry> {
    if let Some(index) = cutoff_index(&history, cutoff) {
        history.truncate(index + 1);
    }
    history
}

fn is_complete(history: &[HistoryEntry]) -> bool {
    history.last().is_some_and(|entry| entry.created)
}

pub fn version_at<'a>(history: &'a [HistoryEntry], date: &str) -> Option<&'a HistoryEntry> {
    history.iter().find(|entry| entry.modified.as_str() <= date)
}

/// One entry per day (the day's oldest), newest day first, at most `max` days.
pub fn compress_history(history: &[HistoryEntry], max: usize) -> Vec<HistoryEntry> {
    let mut compressed: Vec<HistoryEntry> = Vec::new();
    for entry in history {
        let day = day_of(&entry.modified);
        match compressed.last_mut() {
            Some(last) if day_of(&last.modified) == day => *last = entry.clone(),
            _ => compressed.push(entry.clone()),
        }
    }
    compressed.truncate(max);
    compressed
}

fn day_of(timestamp: &str) -> &str {
    timestamp.get(..10).unwrap_or(timestamp)
}

/// Per-title history cache sharing the page cache's flush window.
pub struct HistoryLru {
    cache: WindowedLru<String, Arc<Vec<HistoryEntry>>>,
}

impl HistoryLru {
    pub fn new(capacity: NonZeroUsize, window: Duration) -> Self {
        Self {
            cache: WindowedLru::new("history", capacity, window),
        }
    }

    pub fn lookup(
        &self,
        fetcher: &dyn DocumentFetcher,
        title: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        if let Some(cached) = self.cache.get(title)
            && (cached.len() >= limit || is_complete(&cached))
        {
            debug!(title, limit, "history cache hit");
            return Ok(cached.iter().take(limit).cloned().collect());
        }

        debug!(title, limit, "history cache refresh");
        let mut history = fetcher.fetch_history(title, limit)?;
        if history.len() < limit
            && let Some(oldest) = history.last_mut()
        {
            oldest.created = true;
        }
        self.cache.put(title.to_string(), Arc::new(history.clone()));
        Ok(history)
    }

    pub fn head(&self, fetcher: &dyn DocumentFetcher, title: &str) -> Result<Option<HistoryEntry>> {
        Ok(self.lookup(fetcher, title, 1)?.into_iter().next())
    }

    /// Read the head from the wiki, skipping the cache. A cached list whose
    /// head no longer matches is dropped.
    pub fn refresh_head(
        &self,
        fetcher: &dyn DocumentFetcher,
        title: &str,
    ) -> Result<Option<HistoryEntry>> {
        let head = fetcher.fetch_history(title, 1)?.into_iter().next();
        if let Some(cached) = self.cache.get(title)
            && cached.first().map(|entry| &entry.modified) != head.as_ref().map(|entry| &entry.modified)
        {
            debug!(title, "history head moved, dropping cached history");
            self.cache.remove(title);
        }
        Ok(head)
    }

    pub fn lookup_by_cutoff(
        &self,
        fetcher: &dyn DocumentFetcher,
        title: &str,
        cutoff: &str,
    ) -> Result<Vec<HistoryEntry>> {
        if let Some(cached) = self.cache.get(title) {
            let covers = cached
                .last()
                .is_some_and(|oldest| oldest.created || oldest.modified.as_str() <= cutoff);
            if covers {
                debug!(title, cutoff, "history cache hit");
                return Ok(filter_with_fallback(&cached, cutoff));
            }
        }

        debug!(title, cutoff, "history cache refresh");
        let history = fetcher.fetch_history_since(title, cutoff)?;
        let filtered = filter_with_fallback(&history, cutoff);
        self.cache.put(title.to_string(), Arc::new(history));
        Ok(filtered)
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

fn filter_with_fallback(history: &[HistoryEntry], cutoff: &str) -> Vec<HistoryEntry> {
    match cutoff_index(history, cutoff) {
        Some(index) => history[..=index].to_vec(),
        None => history.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;
    use pretty_assertions::assert_eq;

    fn daily_history(days: u32) -> Vec<HistoryEntry> {
        (0..days)
            .rev()
            .map(|day| {
                let modified = format!("2024,{:02},{:02},12:00", day / 28 + 1, day % 28 + 1);
                HistoryEntry::new(&modified, &format!("https://wiki/rev/{day}"))
            })
            .collect()
    }

    #[test]
    fn cutoff_search_doubles_until_cutoff_is_reached() {
        let fetcher = MockFetcher::default();
        fetcher.add_history("Архів:X", daily_history(200));

        let history = history_from_cutoff(&fetcher, "Архів:X", "2024,02,10,00:00").expect("history");
        let oldest = history.last().expect("entries");
        assert_eq!(oldest.modified, "2024,02,09,12:00");
        assert!(history[..history.len() - 1]
            .iter()
            .all(|entry| entry.modified.as_str() > "2024,02,10,00:00"));
        assert_eq!(fetcher.history_limits(), vec![50, 100, 200]);
    }

    #[test]
    fn cutoff_before_creation_marks_oldest_entry() {
        let fetcher = MockFetcher::default();
        fetcher.add_history("Архів:X", daily_history(60));

        let history = history_from_cutoff(&fetcher, "Архів:X", "2020,01,01").expect("history");
        assert_eq!(history.len(), 60);
        assert!(history.last().expect("oldest").created);
        assert_eq!(fetcher.history_limits(), vec![50, 100]);
    }

    #[test]
    fn compress_keeps_oldest_entry_per_day() {
        let history = vec![
            HistoryEntry::new("2024,01,03,10:00", "c2"),
            HistoryEntry::new("2024,01,03,09:00", "c1"),
            HistoryEntry::new("2024,01,02,18:00", "b"),
            HistoryEntry::new("2024,01,01,08:00", "a"),
        ];
        let compressed = compress_history(&history, 2);
        let links = compressed.iter().map(|entry| entry.link.as_str()).collect::<Vec<_>>();
        assert_eq!(links, vec!["c1", "b"]);
    }

    #[test]
    fn history_lru_serves_shorter_requests_from_cache() {
        let fetcher = MockFetcher::default();
        fetcher.add_history("Архів:X", daily_history(10));
        let lru = HistoryLru::new(NonZeroUsize::new(4).expect("capacity"), Duration::from_secs(60));

        let all = lru.lookup(&fetcher, "Архів:X", 50).expect("lookup");
        assert_eq!(all.len(), 10);
        let head = lru.head(&fetcher, "Архів:X").expect("head").expect("entry");
        assert_eq!(head, all[0]);
        let since = lru
            .lookup_by_cutoff(&fetcher, "Архів:X", "2024,01,05,23:00")
            .expect("cutoff");
        assert_eq!(since.last().expect("entry").modified, "2024,01,05,12:00");
        assert_eq!(fetcher.history_limits(), vec![50]);
    }

    #[test]
    fn version_at_picks_newest_not_after_date() {
        let history = daily_history(5);
        let version = version_at(&history, "2024,01,03,23:59").expect("version");
        assert_eq!(version.modified, "2024,01,03,12:00");
        assert!(version_at(&history, "2023,12,31").is_none());
    }
}
