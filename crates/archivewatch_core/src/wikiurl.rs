//! Helpers for moving between wiki titles, `/wiki/...` hrefs and absolute URLs.

/// Percent-encode a wiki title for a `/wiki/` path. Spaces become underscores,
/// `/` stays literal, everything else non-alphanumeric is escaped (`:` included).
pub fn encode_title(title: &str) -> String {
    title
        .trim()
        .split('/')
        .map(|segment| urlencoding::encode(&segment.replace(' ', "_")).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn decode_component(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

pub fn normalize_title(value: &str) -> String {
    decode_component(value).replace('_', " ").trim().to_string()
}

pub fn wiki_href(title: &str) -> String {
    format!("/wiki/{}", encode_title(title))
}

/// Join a site-relative href onto the base URL; absolute URLs pass through.
pub fn absolutize(base_url: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    if let Some(rest) = link.strip_prefix("//") {
        let scheme = base_url.split("://").next().unwrap_or("https");
        return format!("{scheme}://{rest}");
    }
    let base = base_url.trim_end_matches('/');
    if link.starts_with('/') {
        format!("{base}{link}")
    } else {
        format!("{base}/{link}")
    }
}

/// Site-relative path of a link: scheme and host removed, query and fragment kept.
fn site_path(link: &str) -> &str {
    let without_scheme = match link.find("://") {
        Some(index) => &link[index + 3..],
        None => return link,
    };
    match without_scheme.find('/') {
        Some(index) => &without_scheme[index..],
        None => "/",
    }
}

fn query_param<'a>(link: &'a str, name: &str) -> Option<&'a str> {
    let query = link.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Wiki title addressed by a link, handling both `/wiki/<title>` and
/// `index.php?title=<title>` forms.
pub fn title_from_link(link: &str) -> Option<String> {
    if let Some(title) = query_param(link, "title") {
        return Some(normalize_title(title));
    }
    let path = site_path(link);
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let title = path.strip_prefix("/wiki/")?;
    if title.is_empty() {
        return None;
    }
    Some(normalize_title(title))
}

pub fn oldid_from_link(link: &str) -> Option<u64> {
    query_param(link, "oldid").and_then(|value| value.parse().ok())
}

pub fn last_segment(link: &str) -> Option<String> {
    let title = title_from_link(link)?;
    let segment = title.rsplit('/').next()?.trim();
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

pub fn title_prefix(link: &str) -> Option<String> {
    let title = title_from_link(link)?;
    title
        .rsplit_once('/')
        .map(|(prefix, _)| prefix.to_string())
}

/// Red links point at pages that do not exist yet.
pub fn is_live_link(link: &str) -> bool {
    !link.contains("redlink=1") && !link.contains("action=edit")
}
