//! Canonical `YYYY,MM,DD,HH:mm` timestamps.
//!
//! The format is fixed width and zero padded, so plain string comparison orders
//! timestamps chronologically. Date-only prefixes such as `2025,03,01` sort
//! before every time on that day.

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate, NaiveDateTime};

pub const CANONICAL_FORMAT: &str = "%Y,%m,%d,%H:%M";

const UK_MONTHS: [(&str, &str); 12] = [
    ("січня", "01"),
    ("лютого", "02"),
    ("березня", "03"),
    ("квітня", "04"),
    ("травня", "05"),
    ("червня", "06"),
    ("липня", "07"),
    ("серпня", "08"),
    ("вересня", "09"),
    ("жовтня", "10"),
    ("листопада", "11"),
    ("грудня", "12"),
];

pub fn now_canonical() -> String {
    Local::now().format(CANONICAL_FORMAT).to_string()
}

/// `2024-05-01T10:20:30Z` -> `2024,05,01,10:20`.
pub fn convert_utc_time(value: &str) -> Result<String> {
    let parsed = NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%dT%H:%M:%SZ")
        .with_context(|| format!("failed to parse wiki timestamp {value}"))?;
    Ok(parsed.format(CANONICAL_FORMAT).to_string())
}

/// `19:15, 20 травня 2023` -> `2023,05,20,19:15`.
pub fn format_uk_date(message: &str) -> String {
    let cleaned = message.replace(',', "");
    let parts = cleaned
        .split_whitespace()
        .map(|token| {
            if let Some((_, number)) = UK_MONTHS.iter().find(|(name, _)| *name == token) {
                (*number).to_string()
            } else if token.chars().count() == 1 {
                format!("0{token}")
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>();
    parts.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Pull the edit date out of a sentence like
/// `Цю сторінку востаннє відредаговано о 19:15, 20 травня 2023.`
/// Returns the input unchanged when no date phrase is present.
pub fn lastmod_from_footer(message: &str) -> String {
    let bytes = message.as_bytes();
    let Some(start) = (0..bytes.len().saturating_sub(4)).find(|&index| {
        bytes[index].is_ascii_digit()
            && bytes[index + 1].is_ascii_digit()
            && bytes[index + 2] == b':'
            && bytes[index + 3].is_ascii_digit()
            && bytes[index + 4].is_ascii_digit()
    }) else {
        return message.to_string();
    };
    let search_from = start + 6;
    let end = (search_from..bytes.len().saturating_sub(3))
        .rev()
        .find(|&index| bytes[index..index + 4].iter().all(u8::is_ascii_digit));
    match end {
        Some(end) => format_uk_date(&message[start..end + 4]),
        None => message.to_string(),
    }
}

/// Accept `2025-03-01`, `2025.03.01`, `now`, a Ukrainian date phrase or
/// canonical input and return the canonical comma form.
/// Date-only input stays a date prefix.
pub fn normalize_date_input(value: &str) -> Result<String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("now") {
        return Ok(now_canonical());
    }
    let unified = if UK_MONTHS.iter().any(|(name, _)| value.contains(name)) {
        lastmod_from_footer(value)
    } else {
        value.replace(['-', '.', '/', ' ', 'T'], ",")
    };
    if let Ok(parsed) = NaiveDateTime::parse_from_str(&unified, CANONICAL_FORMAT) {
        return Ok(parsed.format(CANONICAL_FORMAT).to_string());
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(&unified, "%Y,%m,%d") {
        return Ok(parsed.format("%Y,%m,%d").to_string());
    }
    bail!("unrecognized date {value:?}; expected YYYY-MM-DD, YYYY-MM-DD HH:MM, `now` or a Ukrainian date")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_date_is_extracted_and_normalized() {
        let message = "Цю сторінку востаннє відредаговано о 19:15, 20 травня 2023.";
        assert_eq!(lastmod_from_footer(message), "2023,05,20,19:15");
        assert_eq!(lastmod_from_footer("xyz"), "xyz");
    }

    #[test]
    fn single_digit_days_are_padded() {
        assert_eq!(format_uk_date("08:05, 3 січня 2024"), "2024,01,03,08:05");
    }

    #[test]
    fn utc_wiki_timestamps_convert() {
        assert_eq!(
            convert_utc_time("2025-03-04T07:09:59Z").expect("convert"),
            "2025,03,04,07:09"
        );
        assert!(convert_utc_time("yesterday").is_err());
    }

    #[test]
    fn canonical_strings_order_chronologically() {
        assert!("2024,12,31,23:59" < "2025,01,01,00:00");
        assert!("2025,03,01" < "2025,03,01,00:00");
        assert_eq!(normalize_date_input("2025-03-01").expect("date"), "2025,03,01");
    }

    #[test]
    fn date_input_accepts_ukrainian_phrases_and_now() {
        assert_eq!(
            normalize_date_input(" 19:15, 20 травня 2023 ").expect("uk date"),
            "2023,05,20,19:15"
        );
        assert_eq!(
            normalize_date_input("2025.03.01 10:00").expect("dotted"),
            "2025,03,01,10:00"
        );
        assert_eq!(
            normalize_date_input("2025-03-01T07:05").expect("iso"),
            "2025,03,01,07:05"
        );
        assert_eq!(
            normalize_date_input("NOW").expect("now").len(),
            "2025,03,01,10:00".len()
        );
    }

    #[test]
    fn date_input_is_padded_or_rejected() {
        let cutoff = normalize_date_input("2025-3-1").expect("unpadded");
        assert_eq!(cutoff, "2025,03,01");
        assert!("2025,10,02,00:00" > cutoff.as_str());
        assert_eq!(normalize_date_input("2025/3/1 9:05").expect("unpadded time"), "2025,03,01,09:05");
        assert!(normalize_date_input("last tuesday").is_err());
        assert!(normalize_date_input("2025-13-01").is_err());
        assert!(normalize_date_input("").is_err());
    }
}
