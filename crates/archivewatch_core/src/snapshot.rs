use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::text::{EditMark, TextItem, equal_text};

/// One table cell: display text plus the href it links to, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub text: TextItem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<EditMark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_edit: Option<EditMark>,
}

impl Cell {
    pub fn new(text: &str, link: Option<&str>) -> Self {
        Self {
            text: TextItem::from_source(text),
            link: link.map(str::to_string),
            edit: None,
            link_edit: None,
        }
    }
}

/// Content of one page version as read from the wiki.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub title: TextItem,
    #[serde(default)]
    pub description: TextItem,
    #[serde(default)]
    pub header: Vec<TextItem>,
    #[serde(default)]
    pub children: Vec<Vec<Cell>>,
    #[serde(default)]
    pub lastmod: Option<String>,
    #[serde(default)]
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_types: Vec<String>,
    /// Lastmod of the version this snapshot was compared against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refmod: Option<String>,
}

impl Snapshot {
    fn for_each_item_mut(&mut self, mut visit: impl FnMut(&mut TextItem)) {
        visit(&mut self.title);
        visit(&mut self.description);
        for item in &mut self.header {
            visit(item);
        }
        for row in &mut self.children {
            for cell in row {
                visit(&mut cell.text);
            }
        }
    }

    fn items(&self) -> impl Iterator<Item = &TextItem> {
        [&self.title, &self.description]
            .into_iter()
            .chain(self.header.iter())
            .chain(self.children.iter().flatten().map(|cell| &cell.text))
    }

    pub fn needs_translation(&self) -> bool {
        self.items().any(TextItem::needs_translation)
    }

    /// Source text of every untranslated item, in traversal order.
    pub fn untranslated(&self) -> Vec<String> {
        self.items()
            .filter(|item| item.needs_translation())
            .map(|item| item.uk.clone())
            .collect()
    }

    /// Fill untranslated items in traversal order. A short list (from a
    /// cancelled batch) fills a prefix and leaves the rest untranslated.
    /// Returns how many items were filled.
    pub fn apply_translations(&mut self, translations: &[String]) -> usize {
        let mut remaining = translations.iter();
        let mut applied = 0;
        self.for_each_item_mut(|item| {
            if item.needs_translation()
                && let Some(text) = remaining.next()
            {
                item.en = Some(text.clone());
                applied += 1;
            }
        });
        applied
    }

    /// Annotate a copy of `self` against an earlier `reference` version.
    pub fn compared_with(&self, reference: &Snapshot) -> Snapshot {
        let mut annotated = self.clone();
        annotated.refmod = reference.lastmod.clone();
        annotated.title.edit =
            (!equal_text(&self.title, &reference.title)).then_some(EditMark::Changed);
        annotated.description.edit =
            (!equal_text(&self.description, &reference.description)).then_some(EditMark::Changed);

        let reference_rows = reference
            .children
            .iter()
            .filter_map(|row| Some((row.first()?.text.uk.as_str(), row)))
            .collect::<HashMap<_, _>>();

        for row in &mut annotated.children {
            let key = row.first().map(|cell| cell.text.uk.clone()).unwrap_or_default();
            match reference_rows.get(key.as_str()) {
                Some(previous) => {
                    for (index, cell) in row.iter_mut().enumerate() {
                        match previous.get(index) {
                            Some(old) => {
                                cell.edit = (!equal_text(&cell.text, &old.text))
                                    .then_some(EditMark::Changed);
                                cell.link_edit = match (&cell.link, &old.link) {
                                    (Some(_), None) => Some(EditMark::Added),
                                    (current, previous) if current != previous => Some(EditMark::Changed),
                                    _ => None,
                                };
                            }
                            None => {
                                cell.edit = Some(EditMark::Added);
                                cell.link_edit = cell.link.as_ref().map(|_| EditMark::Added);
                            }
                        }
                    }
                }
                None => {
                    for cell in row.iter_mut() {
                        cell.edit = Some(EditMark::Added);
                        cell.link_edit = cell.link.as_ref().map(|_| EditMark::Added);
                    }
                }
            }
        }
        annotated
    }

    /// Text report of comparison annotations; `None` outside comparison state.
    pub fn change_report(&self) -> Option<String> {
        let refmod = self.refmod.as_deref()?;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Changes to {} between {} and {}",
            self.title.get_text(),
            refmod,
            self.lastmod.as_deref().unwrap_or("?")
        );
        if self.title.edit.is_some() {
            let _ = writeln!(out, "  title changed: {}", self.title.get_text());
        }
        if self.description.edit.is_some() {
            let _ = writeln!(out, "  description changed: {}", self.description.get_text());
        }
        for row in &self.children {
            let edited = row
                .iter()
                .filter_map(|cell| cell.edit.or(cell.link_edit))
                .collect::<Vec<_>>();
            if edited.is_empty() {
                continue;
            }
            let label = if edited.iter().all(|mark| *mark == EditMark::Added) {
                EditMark::Added.as_str()
            } else {
                EditMark::Changed.as_str()
            };
            let cells = row
                .iter()
                .map(|cell| cell.text.get_text())
                .collect::<Vec<_>>()
                .join(" | ");
            let _ = writeln!(out, "  [{label}] {cells}");
        }
        Some(out)
    }
}
