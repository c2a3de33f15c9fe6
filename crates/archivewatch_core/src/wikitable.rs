//! Reads the catalogue table out of a page's wikitext.
//!
//! Only the first top-level `{| ... |}` table is used. Text before it becomes
//! the description. Internal links are resolved against the page title and
//! stored as `/wiki/...` hrefs; the first `File:` link becomes the document
//! link.

use crate::snapshot::{Cell, Snapshot};
use crate::text::{TextItem, is_numeric};
use crate::wikiurl::wiki_href;

const FILE_PREFIXES: [&str; 4] = ["file:", "файл:", "image:", "зображення:"];
const IMAGE_EXTENSIONS: [&str; 6] = [".jpg", ".jpeg", ".png", ".gif", ".tif", ".tiff"];

#[derive(Debug, Default, PartialEq, Eq)]
struct Inline {
    text: String,
    links: Vec<String>,
    files: Vec<String>,
}

pub fn snapshot_from_wikitext(page_title: &str, wikitext: &str) -> Snapshot {
    let mut description = Vec::new();
    let mut header = Vec::new();
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut files = Vec::new();
    let mut depth = 0usize;
    let mut table_done = false;

    for line in wikitext.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("{|") {
            depth += 1;
            continue;
        }
        if depth == 0 {
            if table_done {
                files.extend(render_inline(page_title, trimmed).files);
            } else {
                description.push(trimmed.trim_matches('=').trim());
            }
            continue;
        }
        if depth > 1 {
            if trimmed.starts_with("|}") {
                depth -= 1;
            }
            continue;
        }
        if trimmed.starts_with("|}") {
            flush_row(page_title, &mut row, &mut rows, &mut files);
            depth = 0;
            table_done = true;
            continue;
        }
        if table_done || trimmed.starts_with("|+") {
            continue;
        }
        if trimmed.starts_with("|-") {
            flush_row(page_title, &mut row, &mut rows, &mut files);
        } else if let Some(rest) = trimmed.strip_prefix('!') {
            let cells = split_outside(rest, "!!")
                .into_iter()
                .flat_map(|part| split_outside(part, "||"))
                .map(strip_attributes);
            if rows.is_empty() && row.is_empty() {
                header.extend(cells.map(|cell| render_inline(page_title, cell).text));
            } else {
                row.extend(cells.map(str::to_string));
            }
        } else if let Some(rest) = trimmed.strip_prefix('|') {
            row.extend(
                split_outside(rest, "||")
                    .into_iter()
                    .map(strip_attributes)
                    .map(str::to_string),
            );
        } else if let Some(last) = row.last_mut() {
            last.push('\n');
            last.push_str(trimmed);
        }
    }
    flush_row(page_title, &mut row, &mut rows, &mut files);

    let description = render_inline(page_title, &description.join("\n"));
    let mut all_files = description.files.clone();
    all_files.extend(files);
    let doc_link = all_files.first().map(|file| wiki_href(file));
    let thumb_link = all_files
        .iter()
        .find(|file| {
            let lower = file.to_lowercase();
            IMAGE_EXTENSIONS.iter().any(|extension| lower.ends_with(extension))
        })
        .map(|file| wiki_href(file));

    Snapshot {
        title: TextItem::from_source(display_title(page_title)),
        description: TextItem::from_source(&description.text),
        column_types: column_types(header.len(), &rows),
        header: header.iter().map(|text| TextItem::from_source(text)).collect(),
        children: rows,
        doc_link,
        thumb_link,
        ..Snapshot::default()
    }
}

fn flush_row(page_title: &str, row: &mut Vec<String>, rows: &mut Vec<Vec<Cell>>, files: &mut Vec<String>) {
    if row.is_empty() {
        return;
    }
    let cells = row
        .drain(..)
        .map(|raw| {
            let inline = render_inline(page_title, &raw);
            files.extend(inline.files.iter().cloned());
            Cell::new(&inline.text, inline.links.first().map(String::as_str))
        })
        .collect();
    rows.push(cells);
}

fn display_title(page_title: &str) -> &str {
    page_title
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(page_title)
        .trim()
}

fn column_types(columns: usize, rows: &[Vec<Cell>]) -> Vec<String> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(columns);
    (0..width)
        .map(|index| {
            let cells = rows.iter().filter_map(|row| row.get(index)).collect::<Vec<_>>();
            let kind = if cells.iter().any(|cell| cell.link.is_some()) {
                "link"
            } else if !cells.is_empty() && cells.iter().all(|cell| is_numeric(&cell.text.uk)) {
                "number"
            } else {
                "text"
            };
            kind.to_string()
        })
        .collect()
}

/// Split on `separator` where it is not inside `[[...]]` or `{{...}}`.
fn split_outside<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut index = 0;
    while index < bytes.len() {
        let rest = &text[index..];
        if rest.starts_with("[[") || rest.starts_with("{{") {
            depth += 1;
            index += 2;
        } else if (rest.starts_with("]]") || rest.starts_with("}}")) && depth > 0 {
            depth -= 1;
            index += 2;
        } else if depth == 0 && rest.starts_with(separator) {
            parts.push(&text[start..index]);
            index += separator.len();
            start = index;
        } else {
            index += rest.chars().next().map_or(1, char::len_utf8);
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Drop a leading `style="..." |` attribute block from a cell.
fn strip_attributes(cell: &str) -> &str {
    let parts = split_outside(cell, "|");
    match parts.as_slice() {
        [attributes, ..] if parts.len() > 1 && attributes.contains('=') => {
            cell[attributes.len() + 1..].trim()
        }
        _ => cell.trim(),
    }
}

fn is_file_target(target: &str) -> bool {
    let lower = target.trim_start_matches(':').to_lowercase();
    FILE_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}

/// Resolve `/child`, `../sibling` and plain targets against `page_title`.
fn resolve_target(page_title: &str, target: &str) -> String {
    let target = target.split('#').next().unwrap_or(target).trim();
    let target = target.trim_start_matches(':');
    if target.starts_with("../") {
        let mut base = page_title.split('/').collect::<Vec<_>>();
        let mut rest = target;
        while let Some(next) = rest.strip_prefix("../") {
            base.pop();
            rest = next;
        }
        let rest = rest.trim_matches('/');
        if rest.is_empty() {
            return base.join("/");
        }
        base.push(rest);
        return base.join("/");
    }
    if target.starts_with('/') {
        return format!("{page_title}{}", target.trim_end_matches('/'));
    }
    target.trim_end_matches('/').to_string()
}

fn default_label(target: &str) -> String {
    let bare = target.trim_start_matches(':');
    if bare.starts_with('/') && bare.ends_with('/') {
        return bare.trim_matches('/').to_string();
    }
    bare.to_string()
}

fn matching_close(text: &str, open: &str, close: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut index = 0;
    while index < text.len() {
        let rest = &text[index..];
        if rest.starts_with(open) {
            depth += 1;
            index += open.len();
        } else if rest.starts_with(close) {
            depth = depth.saturating_sub(1);
            index += close.len();
            if depth == 0 {
                return Some(index);
            }
        } else {
            index += rest.chars().next().map_or(1, char::len_utf8);
        }
    }
    None
}

/// Plain text of a wikitext fragment plus the links and files it mentions.
fn render_inline(page_title: &str, source: &str) -> Inline {
    let mut inline = Inline::default();
    let mut out = String::new();
    let mut index = 0;
    while index < source.len() {
        let rest = &source[index..];
        if rest.starts_with("[[") {
            let Some(end) = matching_close(rest, "[[", "]]") else {
                out.push_str(rest);
                break;
            };
            let inner = &rest[2..end - 2];
            let (target, label) = match inner.split_once('|') {
                Some((target, label)) => (target, Some(label)),
                None => (inner, None),
            };
            if is_file_target(target) {
                inline.files.push(target.trim_start_matches(':').trim().replace('_', " "));
            } else {
                inline.links.push(wiki_href(&resolve_target(page_title, target)));
                let label = label.map_or_else(|| default_label(target), str::to_string);
                out.push_str(&render_inline(page_title, &label).text);
            }
            index += end;
        } else if rest.starts_with("{{") {
            index += matching_close(rest, "{{", "}}").unwrap_or(rest.len());
        } else if rest.starts_with("[http://") || rest.starts_with("[https://") {
            let end = rest.find(']').unwrap_or(rest.len());
            let inner = &rest[1..end];
            match inner.split_once(' ') {
                Some((url, label)) => {
                    inline.links.push(url.to_string());
                    out.push_str(label);
                }
                None => inline.links.push(inner.to_string()),
            }
            index += (end + 1).min(rest.len());
        } else if rest.starts_with('<') {
            let end = rest.find('>').map_or(rest.len(), |end| end + 1);
            out.push(' ');
            index += end;
        } else if rest.starts_with("''") {
            index += rest.bytes().take_while(|byte| *byte == b'\'').count();
        } else {
            let next = rest.chars().next().map_or(1, char::len_utf8);
            out.push_str(&rest[..next]);
            index += next;
        }
    }
    inline.text = out.split_whitespace().collect::<Vec<_>>().join(" ");
    inline
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = "Архів:ДАКО/Д";

    #[test]
    fn reads_header_rows_and_links() {
        let wikitext = "\
== Опис фондів ==
Фонди '''архіву''' {{шаблон|x}} станом на 2024.
{| class=\"wikitable sortable\"
|+ Фонди
! Фонд !! Назва
|-
| [[/1455/]] || Канцелярія
|-
| style=\"text-align:right\" | [[Архів:ДАКО/Д/1500|1500]]
| Друга
установа
|}
[[Файл:Опис 1455.pdf|thumb]]
";
        let snapshot = snapshot_from_wikitext(PAGE, wikitext);
        assert_eq!(snapshot.title.uk, "ДАКО/Д");
        assert_eq!(snapshot.description.uk, "Опис фондів Фонди архіву станом на 2024.");
        assert_eq!(
            snapshot.header.iter().map(|item| item.uk.as_str()).collect::<Vec<_>>(),
            vec!["Фонд", "Назва"]
        );
        let fond_1455 = wiki_href("Архів:ДАКО/Д/1455");
        let fond_1500 = wiki_href("Архів:ДАКО/Д/1500");
        assert_eq!(
            snapshot.children,
            vec![
                vec![
                    Cell::new("1455", Some(fond_1455.as_str())),
                    Cell::new("Канцелярія", None),
                ],
                vec![
                    Cell::new("1500", Some(fond_1500.as_str())),
                    Cell::new("Друга установа", None),
                ],
            ]
        );
        assert_eq!(snapshot.doc_link, Some(wiki_href("Файл:Опис 1455.pdf")));
        assert_eq!(snapshot.thumb_link, None);
        assert_eq!(snapshot.column_types, vec!["link", "text"]);
        assert_eq!(snapshot.lastmod, None);
    }

    #[test]
    fn relative_targets_resolve_against_the_page() {
        assert_eq!(resolve_target(PAGE, "/1455/"), "Архів:ДАКО/Д/1455");
        assert_eq!(resolve_target(PAGE, "../Р/7"), "Архів:ДАКО/Р/7");
        assert_eq!(resolve_target(PAGE, ":Архів:ДАКО/П#top"), "Архів:ДАКО/П");
        assert_eq!(default_label("/1455/"), "1455");
        assert_eq!(default_label("/1455"), "/1455");
    }

    #[test]
    fn nested_tables_and_pipes_inside_links_are_ignored() {
        let wikitext = "\
{|
| [[A|a]] || b {{t|1||2}}
|-
|
{|
| inner
|}
| tail
|}
";
        let snapshot = snapshot_from_wikitext("Title", wikitext);
        assert_eq!(snapshot.children.len(), 2);
        assert_eq!(snapshot.children[0][0].text.uk, "a");
        assert_eq!(snapshot.children[0][1].text.uk, "b");
        assert_eq!(snapshot.children[1].len(), 2);
        assert_eq!(snapshot.children[1][1].text.uk, "tail");
        assert!(snapshot.header.is_empty());
    }

    #[test]
    fn image_files_become_thumbnails() {
        let wikitext = "[[File:Scan_1.jpg|200px]]\n{|\n| 1\n|}";
        let snapshot = snapshot_from_wikitext("Title", wikitext);
        assert_eq!(snapshot.doc_link, Some(wiki_href("File:Scan 1.jpg")));
        assert_eq!(snapshot.thumb_link, snapshot.doc_link);
        assert_eq!(snapshot.column_types, vec!["number"]);
    }
}
