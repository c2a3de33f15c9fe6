use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::fetcher::{DocumentFetcher, FeedEntry, HistoryEntry};
use crate::http::{HttpSettings, RequestPacer, is_retryable_error, is_retryable_status};
use crate::snapshot::Snapshot;
use crate::timestamp::convert_utc_time;
use crate::wikiurl::{encode_title, oldid_from_link, title_from_link, wiki_href};
use crate::wikitable::snapshot_from_wikitext;

const MAX_API_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaWikiSettings {
    pub base_url: String,
    pub api_url: String,
    pub http: HttpSettings,
}

/// Reads pages, revision lists and the search feed through the MediaWiki
/// action API. Safe to share between threads.
pub struct MediaWikiFetcher {
    client: Client,
    base_url: String,
    api_url: Url,
    max_retries: usize,
    pacer: RequestPacer,
}

impl MediaWikiFetcher {
    pub fn new(settings: MediaWikiSettings) -> Result<Self> {
        let api_url = Url::parse(&settings.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", settings.api_url))?;
        Ok(Self {
            client: settings
                .http
                .build_client()
                .context("failed to build MediaWiki HTTP client")?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_url,
            max_retries: settings.http.max_retries,
            pacer: RequestPacer::new(&settings.http),
        })
    }

    fn request_json_get(&self, params: &[(&str, String)]) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.max_retries {
            self.pacer.pace();
            let response = self.client.get(self.api_url.clone()).query(&pairs).send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.max_retries && is_retryable_status(status) {
                            self.pacer.wait_before_retry(attempt, "mediawiki");
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.max_retries && is_retryable_error(&error) {
                        self.pacer.wait_before_retry(attempt, "mediawiki");
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn revision_link(&self, title: &str, revid: u64) -> String {
        format!(
            "{}/w/index.php?title={}&oldid={revid}",
            self.base_url,
            encode_title(title)
        )
    }
}

impl DocumentFetcher for MediaWikiFetcher {
    fn fetch_snapshot(&self, url: &str) -> Result<Snapshot> {
        let mut params = vec![
            ("action", "parse".to_string()),
            ("prop", "wikitext".to_string()),
        ];
        if let Some(oldid) = oldid_from_link(url) {
            params.push(("oldid", oldid.to_string()));
        } else if let Some(title) = title_from_link(url) {
            params.push(("page", title));
        } else {
            bail!("cannot derive a wiki page from {url}");
        }

        let response = self.request_json_get(&params)?;
        let parsed: ParseResponse = serde_json::from_value(response)
            .with_context(|| format!("failed to decode parse response for {url}"))?;
        debug!(%url, title = %parsed.parse.title, revid = parsed.parse.revid, "parsed page wikitext");
        let mut snapshot = snapshot_from_wikitext(&parsed.parse.title, &parsed.parse.wikitext);
        snapshot.link = url.to_string();
        Ok(snapshot)
    }

    fn fetch_history(&self, title: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries = Vec::new();
        let mut continue_token: Option<String> = None;
        while entries.len() < limit {
            let batch = (limit - entries.len()).min(MAX_API_LIMIT);
            let mut params = vec![
                ("action", "query".to_string()),
                ("prop", "revisions".to_string()),
                ("titles", title.to_string()),
                ("rvprop", "ids|timestamp".to_string()),
                ("rvlimit", batch.to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("rvcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .with_context(|| format!("failed to decode revisions of {title}"))?;
            let Some(page) = parsed.query.pages.into_iter().next() else {
                break;
            };
            if page.missing.unwrap_or(false) {
                break;
            }
            for revision in page.revisions {
                let mut entry = HistoryEntry::new(
                    &convert_utc_time(&revision.timestamp)?,
                    &self.revision_link(&page.title, revision.revid),
                );
                entry.revid = Some(revision.revid);
                entry.created = revision.parentid == Some(0);
                entries.push(entry);
            }
            continue_token = parsed.continuation.and_then(|cont| cont.rvcontinue);
            if continue_token.is_none() {
                break;
            }
        }
        entries.truncate(limit);
        Ok(entries)
    }

    fn fetch_change_feed(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<FeedEntry>> {
        let mut entries = Vec::new();
        let mut next_offset = Some(offset);
        while entries.len() < limit {
            let Some(current) = next_offset else {
                break;
            };
            let batch = (limit - entries.len()).min(MAX_API_LIMIT);
            let params = vec![
                ("action", "query".to_string()),
                ("list", "search".to_string()),
                ("srsearch", format!("prefix:{query}")),
                ("srnamespace", "*".to_string()),
                ("srsort", "last_edit_desc".to_string()),
                ("srprop", "timestamp".to_string()),
                ("srlimit", batch.to_string()),
                ("sroffset", current.to_string()),
            ];
            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .with_context(|| format!("failed to decode search feed for {query}"))?;
            for item in parsed.query.search {
                let Some(timestamp) = item.timestamp else {
                    continue;
                };
                entries.push(FeedEntry {
                    link: wiki_href(&item.title),
                    lastmod: convert_utc_time(&timestamp)?,
                    title: item.title,
                });
            }
            next_offset = parsed.continuation.and_then(|cont| cont.sroffset);
        }
        entries.truncate(limit);
        Ok(entries)
    }

    fn request_count(&self) -> usize {
        self.pacer.request_count()
    }
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    parse: ParsePayload,
}

#[derive(Debug, Deserialize)]
struct ParsePayload {
    title: String,
    #[serde(default)]
    revid: u64,
    #[serde(default)]
    wikitext: String,
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
    #[serde(default)]
    search: Vec<SearchQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    rvcontinue: Option<String>,
    sroffset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    title: String,
    missing: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: u64,
    parentid: Option<u64>,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct SearchQueryItem {
    title: String,
    timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpSettings;
    use pretty_assertions::assert_eq;

    fn fetcher() -> MediaWikiFetcher {
        MediaWikiFetcher::new(MediaWikiSettings {
            base_url: "https://uk.wikisource.org/".to_string(),
            api_url: "https://uk.wikisource.org/w/api.php".to_string(),
            http: HttpSettings::new("archivewatch-test/0.1"),
        })
        .expect("fetcher")
    }

    #[test]
    fn revision_links_point_at_index_php() {
        let link = fetcher().revision_link("Архів:ДАКО/Д", 42);
        assert_eq!(
            link,
            format!(
                "https://uk.wikisource.org/w/index.php?title={}&oldid=42",
                encode_title("Архів:ДАКО/Д")
            )
        );
        assert_eq!(oldid_from_link(&link), Some(42));
        assert_eq!(title_from_link(&link).as_deref(), Some("Архів:ДАКО/Д"));
    }

    #[test]
    fn rejects_invalid_api_url() {
        let result = MediaWikiFetcher::new(MediaWikiSettings {
            base_url: "https://example.org".to_string(),
            api_url: "not a url".to_string(),
            http: HttpSettings::new("test"),
        });
        assert!(result.is_err());
    }

    #[test]
    fn decodes_revision_and_search_payloads() {
        let revisions: QueryResponse = serde_json::from_value(serde_json::json!({
            "continue": {"rvcontinue": "20240101|7", "continue": "||"},
            "query": {"pages": [{
                "pageid": 1, "ns": 106, "title": "Архів:ДАКО/Д",
                "revisions": [
                    {"revid": 9, "parentid": 7, "timestamp": "2024-05-01T10:20:30Z"},
                    {"revid": 7, "parentid": 0, "timestamp": "2023-01-01T00:00:00Z"}
                ]
            }]}
        }))
        .expect("revisions");
        assert_eq!(
            revisions.continuation.and_then(|cont| cont.rvcontinue).as_deref(),
            Some("20240101|7")
        );
        assert_eq!(revisions.query.pages[0].revisions[1].parentid, Some(0));

        let search: QueryResponse = serde_json::from_value(serde_json::json!({
            "continue": {"sroffset": 50, "continue": "-||"},
            "query": {"search": [{"ns": 106, "title": "Архів:ДАКО/Д/1", "timestamp": "2024-05-01T10:20:30Z"}]}
        }))
        .expect("search");
        assert_eq!(search.continuation.and_then(|cont| cont.sroffset), Some(50));
        assert_eq!(search.query.search[0].title, "Архів:ДАКО/Д/1");
    }
}
