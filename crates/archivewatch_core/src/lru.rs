use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, info};

use crate::archivist::Archivist;
use crate::page::{Address, Page};

pub const DEFAULT_CAPACITY: usize = 500;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

struct WindowState<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    started: Instant,
}

/// Recency cache that drops every entry once its window elapses, so nothing
/// outlives the window regardless of how often it is read.
pub struct WindowedLru<K: Hash + Eq, V> {
    label: &'static str,
    window: Duration,
    state: Mutex<WindowState<K, V>>,
}

impl<K: Hash + Eq, V: Clone> WindowedLru<K, V> {
    pub fn new(label: &'static str, capacity: NonZeroUsize, window: Duration) -> Self {
        Self {
            label,
            window,
            state: Mutex::new(WindowState {
                entries: LruCache::new(capacity),
                started: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WindowState<K, V>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.started.elapsed() >= self.window {
            if !state.entries.is_empty() {
                info!(cache = self.label, entries = state.entries.len(), "flushing cache window");
            }
            state.entries.clear();
            state.started = Instant::now();
        }
        state
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state().entries.get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.state().entries.put(key, value);
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state().entries.pop(key)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.started = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `(archive, subarchive, fond, opus, case)` with empty strings for absent levels.
pub type PageKey = [String; 5];

#[derive(Debug, Error)]
#[error("page not found: {}", .key.join(","))]
pub struct NotFoundError {
    pub key: PageKey,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

/// Address-keyed cache of loaded pages. Misses resolve the parent through the
/// cache first, so walking down a tree warms every ancestor.
pub struct PageLru {
    cache: WindowedLru<PageKey, Page>,
}

impl Default for PageLru {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            DEFAULT_WINDOW,
        )
    }
}

impl PageLru {
    pub fn new(capacity: NonZeroUsize, window: Duration) -> Self {
        Self {
            cache: WindowedLru::new("page", capacity, window),
        }
    }

    pub fn lookup(&self, ctx: &Archivist, address: &Address) -> Result<Page, NotFoundError> {
        let address = ctx.canonical_address(address);
        let key = address.cache_key();
        if let Some(page) = self.cache.get(&key) {
            debug!(page = %address, "page cache hit");
            return Ok(page);
        }
        debug!(page = %address, "page cache miss");

        let page = self
            .resolve(ctx, &address)
            .map_err(|source| NotFoundError {
                key: key.clone(),
                source: source.into(),
            })?;
        self.cache.put(key, page.clone());
        Ok(page)
    }

    fn resolve(&self, ctx: &Archivist, address: &Address) -> anyhow::Result<Page> {
        match address.parent() {
            None => {
                let mut page = Page::archive(ctx, &address.archive, &address.subarchive)?;
                page.load(ctx);
                Ok(page)
            }
            Some(parent_address) => {
                let parent = self.lookup(ctx, &parent_address)?;
                Ok(parent.lookup(ctx, address.id())?)
            }
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFetcher, archivist_with, fond_fixture};
    use std::collections::HashMap;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn capacity(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).expect("capacity")
    }

    #[test]
    fn window_flush_drops_entries() {
        let cache: WindowedLru<String, u32> = WindowedLru::new("test", capacity(2), Duration::ZERO);
        cache.put("a".to_string(), 1);
        assert_eq!(cache.get("a"), None);

        let cache: WindowedLru<String, u32> =
            WindowedLru::new("test", capacity(2), Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.put("c".to_string(), 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn repeated_lookups_fetch_the_ancestor_chain_once() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher.clone());
        let lru = PageLru::new(capacity(4), Duration::from_secs(3600));
        let address = Address::new("DAKO", "D", Some("1455"), Some("1"), None);

        for _ in 0..5 {
            let page = lru.lookup(&ctx, &address).expect("lookup");
            assert_eq!(page.name(), "DAKO-D/1455/1");
            assert!(page.has_content());
        }
        let calls = fetcher.snapshot_calls();
        assert_eq!(calls.len(), 3, "{calls:?}");
    }

    #[test]
    fn concurrent_lookups_share_one_cache() {
        const THREADS: usize = 8;
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = Arc::new(archivist_with(fetcher.clone()));
        let lru = Arc::new(PageLru::new(capacity(16), Duration::from_secs(3600)));
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers = (0..THREADS)
            .map(|index| {
                let ctx = Arc::clone(&ctx);
                let lru = Arc::clone(&lru);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let (address, expected) = if index % 2 == 0 {
                        (Address::new("DAKO", "D", Some("1455"), Some("1"), Some("169")), "DAKO-D/1455/1/169")
                    } else {
                        (Address::new("DAKO", "D", Some("1455"), Some("1"), None), "DAKO-D/1455/1")
                    };
                    barrier.wait();
                    let page = lru.lookup(&ctx, &address).expect("lookup");
                    assert_eq!(page.name(), expected);
                    assert!(page.has_content());
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().expect("lookup thread");
        }

        let calls = fetcher.snapshot_calls();
        let mut per_url: HashMap<&str, usize> = HashMap::new();
        for url in &calls {
            *per_url.entry(url.as_str()).or_default() += 1;
        }
        assert_eq!(per_url.len(), 4, "{calls:?}");
        assert!(per_url.values().all(|count| *count <= THREADS), "{calls:?}");

        let settled = calls.len();
        let case = Address::new("DAKO", "D", Some("1455"), Some("1"), Some("169"));
        assert_eq!(lru.lookup(&ctx, &case).expect("cached").name(), "DAKO-D/1455/1/169");
        assert_eq!(fetcher.snapshot_calls().len(), settled);
    }

    #[test]
    fn missing_child_surfaces_not_found_with_key() {
        let fetcher = Arc::new(MockFetcher::default());
        fond_fixture(&fetcher);
        let ctx = archivist_with(fetcher);
        let lru = PageLru::default();
        let address = Address::new("DAKO", "D", Some("9999"), None, None);

        let error = lru.lookup(&ctx, &address).expect_err("must fail");
        assert_eq!(error.key[2], "9999");
        assert!(error.to_string().contains("DAKO,D,9999"));
    }

    #[test]
    fn unknown_archive_is_not_found() {
        let ctx = archivist_with(Arc::new(MockFetcher::default()));
        let error = PageLru::default()
            .lookup(&ctx, &Address::archive("NOWHERE", "D"))
            .expect_err("must fail");
        assert_eq!(error.key[0], "NOWHERE");
    }
}
