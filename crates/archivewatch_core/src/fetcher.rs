use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::history;
use crate::snapshot::Snapshot;

/// One revision of a page, most recent first in every list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub modified: String,
    /// URL that renders this exact revision.
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revid: Option<u64>,
    /// Set on the oldest entry once the full history is known.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub created: bool,
}

impl HistoryEntry {
    pub fn new(modified: &str, link: &str) -> Self {
        Self {
            modified: modified.to_string(),
            link: link.to_string(),
            revid: None,
            created: false,
        }
    }
}

/// One hit in the site-wide recently-edited feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub lastmod: String,
}

/// Remote source of page content, revision history and the change feed.
pub trait DocumentFetcher: Send + Sync {
    fn fetch_snapshot(&self, url: &str) -> Result<Snapshot>;

    /// Up to `limit` revisions of `title`, newest first.
    fn fetch_history(&self, title: &str, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Revisions of `title` reaching back to the first one at or before `cutoff`.
    fn fetch_history_since(&self, title: &str, cutoff: &str) -> Result<Vec<HistoryEntry>> {
        history::history_from_cutoff(self, title, cutoff)
    }

    /// Site-wide edits matching `query`, most recently edited first.
    fn fetch_change_feed(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<FeedEntry>>;

    fn request_count(&self) -> usize;
}
