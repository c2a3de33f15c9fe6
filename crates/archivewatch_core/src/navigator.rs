use thiserror::Error;
use tracing::debug;

use crate::archivist::Archivist;
use crate::page::Page;
use crate::snapshot::Cell;
use crate::wikiurl::{encode_title, last_segment, title_prefix};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{page}: no child entry matching '{id}'")]
pub struct LookupError {
    pub page: String,
    pub id: String,
}

/// Whether a row's identifying cell names `id`, by either language variant or
/// by the last segment of its link.
pub fn row_matches(row: &[Cell], id: &str) -> bool {
    let Some(cell) = row.first() else {
        return false;
    };
    if cell.text.matches(id) {
        return true;
    }
    cell.link
        .as_deref()
        .and_then(last_segment)
        .is_some_and(|segment| segment == id)
}

pub fn find_row<'a>(rows: &'a [Vec<Cell>], id: &str) -> Option<&'a [Cell]> {
    rows.iter()
        .map(Vec::as_slice)
        .find(|row| row_matches(row, id))
}

impl Page {
    /// Resolve the child identified by `id`.
    ///
    /// A matching row yields its linked page. When the row's link sits next to
    /// this page rather than below it, the result is this page's sibling and
    /// is placed under this page's parent. Without a row, `<url>/<id>` is tried
    /// and kept if it loads; failing that, the rows of children already in the
    /// store are searched one level down.
    pub fn lookup(&self, ctx: &Archivist, id: &str) -> Result<Page, LookupError> {
        let id = id.trim();
        let not_found = || LookupError {
            page: self.name(),
            id: id.to_string(),
        };
        if self.kind().child_kind().is_none() {
            return Err(not_found());
        }

        if let Some(row) = find_row(self.rows(), id) {
            let link = row.first().and_then(|cell| cell.link.as_deref());
            let mut child = self.spawn_from_row(ctx, id, link).ok_or_else(not_found)?;
            child.load(ctx);
            return Ok(child);
        }

        if let Some(child) = self.shadow_child(ctx, id) {
            return Ok(child);
        }

        self.deep_search(ctx, id).ok_or_else(not_found)
    }

    fn spawn_from_row(&self, ctx: &Archivist, id: &str, link: Option<&str>) -> Option<Page> {
        if let (Some(link), Some(parent)) = (link, self.parent_handle())
            && self.is_sibling_link(link)
        {
            debug!(page = %self.address(), id, link, "row links to a sibling, placing under parent");
            let address = parent.address.child(id)?;
            return Some(Page::under(ctx, Some(parent), address, Some(link)));
        }
        let address = self.address().child(id)?;
        Some(Page::under(ctx, Some(self.as_parent_link()), address, link))
    }

    fn is_sibling_link(&self, link: &str) -> bool {
        let Some(own) = self.default_url() else {
            return false;
        };
        let (Some(own_prefix), Some(link_prefix)) = (title_prefix(own), title_prefix(link)) else {
            return false;
        };
        link_prefix == own_prefix
    }

    fn shadow_child(&self, ctx: &Archivist, id: &str) -> Option<Page> {
        let base = self.default_url()?;
        let address = self.address().child(id)?;
        let url = format!("{}/{}", base.trim_end_matches('/'), encode_title(id));
        debug!(page = %self.address(), id, %url, "trying unlisted child");
        let mut child = Page::under(ctx, Some(self.as_parent_link()), address, None)
            .with_default_url(Some(url));
        child.load(ctx).then_some(child)
    }

    fn deep_search(&self, ctx: &Archivist, id: &str) -> Option<Page> {
        for row in self.rows() {
            let Some(cell) = row.first() else {
                continue;
            };
            let child_id = cell.text.uk.as_str();
            let Some(mut child) = self.spawn_from_row(ctx, child_id, cell.link.as_deref()) else {
                continue;
            };
            match child.cache_load_local(ctx) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    debug!(page = %child.address(), error = %format!("{error:#}"), "skipping child in deep search");
                    continue;
                }
            }
            let Some(found) = find_row(child.rows(), id) else {
                continue;
            };
            debug!(page = %self.address(), id, via = %child.address(), "found entry one level down");
            let link = found.first().and_then(|cell| cell.link.as_deref());
            let address = self.address().child(id)?;
            let mut page = Page::under(ctx, Some(self.as_parent_link()), address, link);
            page.load(ctx);
            return Some(page);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Address;
    use crate::testing::{DAKO, MockFetcher, archivist_with, fond_fixture, page_url, snapshot_with_rows};
    use crate::wikiurl::wiki_href;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn loaded_archive(ctx: &Archivist) -> Page {
        let mut archive = Page::archive(ctx, "DAKO", "D").expect("archive");
        assert!(archive.load(ctx));
        archive
    }

    #[test]
    fn rows_match_by_text_or_link_segment() {
        let link = wiki_href("Архів:ДАКО/Д/12");
        let row = vec![Cell::new("ф. 12", Some(link.as_str()))];
        assert!(row_matches(&row, "ф. 12"));
        assert!(row_matches(&row, "12"));
        assert!(!row_matches(&row, "13"));
        assert!(!row_matches(&[], "12"));
    }

    #[test]
    fn listed_child_is_loaded_under_this_page() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher);
        let archive = loaded_archive(&ctx);

        let fond = archive.lookup(&ctx, "1455").expect("fond");
        assert_eq!(fond.name(), "DAKO-D/1455");
        assert!(fond.has_content());
        assert_eq!(
            fond.parent().map(|parent| parent.address.path()),
            Some("DAKO-D".to_string())
        );
        let opus = fond.lookup(&ctx, "1").expect("opus");
        assert_eq!(opus.name(), "DAKO-D/1455/1");
    }

    #[test]
    fn listed_child_without_content_is_still_returned() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher);
        let archive = loaded_archive(&ctx);

        let fond = archive.lookup(&ctx, "1500").expect("listed");
        assert!(!fond.has_content());
    }

    #[test]
    fn sibling_links_are_placed_under_the_parent() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let fond_title = format!("{DAKO}/1455");
        let opus_title = format!("{DAKO}/1455/1");
        let sibling = format!("{DAKO}/1455-a");
        fetcher.add_current(
            &fond_title,
            "2025,03,04,08:00",
            snapshot_with_rows(&fond_title, &[("1", opus_title.as_str()), ("2", sibling.as_str())]),
        );
        fetcher.add_current(&sibling, "2025,03,04,08:00", snapshot_with_rows(&sibling, &[]));
        let ctx = archivist_with(fetcher);
        let fond = loaded_archive(&ctx).lookup(&ctx, "1455").expect("fond");

        let aliased = fond.lookup(&ctx, "2").expect("aliased");
        assert_eq!(aliased.name(), "DAKO-D/2");
        assert!(aliased.has_content());
        assert_eq!(aliased.default_url(), Some(page_url(&sibling).as_str()));

        let child = fond.lookup(&ctx, "1").expect("child");
        assert_eq!(child.name(), "DAKO-D/1455/1");
    }

    #[test]
    fn unlisted_child_is_found_by_url_shadowing() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let hidden = format!("{DAKO}/2000");
        fetcher.add_current(&hidden, "2025,01,01,00:00", snapshot_with_rows(&hidden, &[]));
        let ctx = archivist_with(fetcher);

        let fond = loaded_archive(&ctx).lookup(&ctx, "2000").expect("shadow");
        assert_eq!(fond.name(), "DAKO-D/2000");
        assert!(fond.has_content());
    }

    #[test]
    fn entries_missing_from_the_table_are_found_one_level_down() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let stray = "Архів:ДАКО/Д/stray-1455-2";
        fetcher.add_current(stray, "2025,01,01,00:00", snapshot_with_rows(stray, &[]));
        let fond_title = format!("{DAKO}/1455");
        let opus_title = format!("{DAKO}/1455/1");
        fetcher.add_current(
            &fond_title,
            "2025,03,01,08:00",
            snapshot_with_rows(&fond_title, &[("1", opus_title.as_str()), ("2", stray)]),
        );
        let ctx = archivist_with(fetcher);
        let archive = loaded_archive(&ctx);
        archive.lookup(&ctx, "1455").expect("warm fond cache");

        let found = archive.lookup(&ctx, "2").expect("deep");
        assert_eq!(found.name(), "DAKO-D/2");
        assert_eq!(found.default_url(), Some(page_url(stray).as_str()));
    }

    #[test]
    fn exhausted_lookup_reports_page_and_id() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher);
        let error = loaded_archive(&ctx).lookup(&ctx, "404").expect_err("missing");
        assert_eq!(
            error,
            LookupError {
                page: "DAKO-D".to_string(),
                id: "404".to_string(),
            }
        );

        let case_address = Address::new("DAKO", "D", Some("1455"), Some("1"), Some("169"));
        let case = Page::under(&ctx, None, case_address, None);
        assert!(case.lookup(&ctx, "1").is_err());
    }
}
