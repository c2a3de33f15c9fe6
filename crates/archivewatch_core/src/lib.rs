pub mod archivist;
pub mod catalog;
pub mod config;
pub mod fetcher;
pub mod history;
pub mod http;
pub mod lru;
pub mod mediawiki;
pub mod navigator;
pub mod page;
pub mod runtime;
pub mod snapshot;
pub mod store;
pub mod text;
pub mod timestamp;
pub mod translate;
pub mod watcher;
pub mod wikitable;
pub mod wikiurl;

#[cfg(test)]
mod testing;
