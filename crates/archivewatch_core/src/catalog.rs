use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

const EMBEDDED_CATALOG: &str = include_str!("../../../config/archives.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subarchive {
    pub uk: String,
    pub en: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub subarchives: Vec<String>,
}

/// Archive tags known to the wiki and the subarchive naming table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCatalog {
    pub archives: Vec<ArchiveEntry>,
    pub subarchives: Vec<Subarchive>,
}

impl ArchiveCatalog {
    pub fn embedded() -> Result<Self> {
        Self::from_json(EMBEDDED_CATALOG).context("failed to parse embedded archive catalog")
    }

    /// Raw JSON of the embedded catalog, for writing an editable copy.
    pub fn embedded_json() -> &'static str {
        EMBEDDED_CATALOG
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(content)?;
        if catalog.subarchives.is_empty() {
            bail!("archive catalog lists no subarchives");
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn archive_name(&self, tag: &str) -> Option<&str> {
        self.archives
            .iter()
            .find(|entry| entry.tag.eq_ignore_ascii_case(tag))
            .map(|entry| entry.name.as_str())
    }

    pub fn archive_tag(&self, tag: &str) -> Option<&str> {
        self.archives
            .iter()
            .find(|entry| entry.tag.eq_ignore_ascii_case(tag))
            .map(|entry| entry.tag.as_str())
    }

    /// Accepts either language variant; unknown values fall back to the first
    /// subarchive in the table.
    pub fn decode_subarchive(&self, value: &str) -> &Subarchive {
        let value = value.trim();
        self.subarchives
            .iter()
            .find(|item| item.uk == value || item.en.eq_ignore_ascii_case(value))
            .unwrap_or(&self.subarchives[0])
    }

    pub fn all_archives(&self) -> Vec<(String, String)> {
        self.archives
            .iter()
            .flat_map(|entry| {
                entry
                    .subarchives
                    .iter()
                    .map(|sub| (entry.tag.clone(), sub.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_catalog_parses() {
        let catalog = ArchiveCatalog::embedded().expect("catalog");
        assert_eq!(catalog.archive_name("DAZHO"), Some("ДАЖО"));
        assert_eq!(catalog.archive_name("dako"), Some("ДАКО"));
        assert_eq!(catalog.archive_name("NOPE"), None);
        assert!(
            catalog
                .all_archives()
                .contains(&("DAKO".to_string(), "D".to_string()))
        );
    }

    #[test]
    fn subarchive_decodes_either_language_and_falls_back() {
        let catalog = ArchiveCatalog::embedded().expect("catalog");
        assert_eq!(catalog.decode_subarchive("Р").en, "R");
        assert_eq!(catalog.decode_subarchive("r").uk, "Р");
        assert_eq!(catalog.decode_subarchive("unknown").uk, "Д");
    }

    #[test]
    fn empty_subarchive_table_is_rejected() {
        let error = ArchiveCatalog::from_json(r#"{"archives":[],"subarchives":[]}"#)
            .expect_err("must fail");
        assert!(error.to_string().contains("no subarchives"));
    }
}
