use serde::{Deserialize, Serialize};

/// Annotation left on a text item or cell by a snapshot comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMark {
    Changed,
    Added,
}

impl EditMark {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Changed => "changed",
            Self::Added => "added",
        }
    }
}

/// Ukrainian source text with an optional English rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextItem {
    #[serde(default)]
    pub uk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<EditMark>,
}

impl TextItem {
    /// Numeric, empty, and ASCII-only text is its own English rendering.
    pub fn from_source(text: &str) -> Self {
        let text = text.trim();
        let en = if text.is_empty() || is_numeric(text) || is_english(text) {
            Some(text.to_string())
        } else {
            None
        };
        Self {
            uk: text.to_string(),
            en,
            edit: None,
        }
    }

    pub fn translated(uk: &str, en: &str) -> Self {
        Self {
            uk: uk.to_string(),
            en: Some(en.to_string()),
            edit: None,
        }
    }

    /// English if present, else Ukrainian.
    pub fn get_text(&self) -> &str {
        self.en.as_deref().unwrap_or(&self.uk)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.uk == text || self.en.as_deref() == Some(text)
    }

    pub fn needs_translation(&self) -> bool {
        self.en.is_none()
    }
}

/// Compare English renderings when both sides have one, else the source text.
pub fn equal_text(left: &TextItem, right: &TextItem) -> bool {
    match (&left.en, &right.en) {
        (Some(left_en), Some(right_en)) => left_en == right_en,
        _ => left.uk == right.uk,
    }
}

/// Digits, or a digit range separated by `-` or `–`.
pub fn is_numeric(text: &str) -> bool {
    let text = text.trim();
    let (head, tail) = match text.find(['-', '–']) {
        Some(index) => {
            let dash_len = text[index..].chars().next().map_or(1, char::len_utf8);
            (&text[..index], Some(&text[index + dash_len..]))
        }
        None => (text, None),
    };
    let all_digits = |value: &str| !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit());
    all_digits(head) && tail.is_none_or(all_digits)
}

pub fn is_english(text: &str) -> bool {
    text.is_ascii()
}
