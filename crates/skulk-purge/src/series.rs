//! Composite keys and series keys.
//!
//! Every block in a segment is addressed by a composite key: the series key
//! (measurement plus ordered tags) followed by [`FIELD_SEPARATOR`] and the
//! field name. Deletion works on series keys, so all fields of a series share
//! one deletion target.
//!
//! ```text
//! cpu,host=a,region=eu#!~#usage_idle
//! └──── series key ───┘    └ field ┘
//! ```

use std::fmt;
use thiserror::Error;

/// Separator between the series key and the field name in a composite key.
pub const FIELD_SEPARATOR: &[u8] = b"#!~#";

/// Reasons a composite or series key cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The composite key has no field separator.
    #[error("missing field separator")]
    MissingField,
    /// The key bytes are not valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,
    /// The series key has no measurement name.
    #[error("empty measurement")]
    EmptyMeasurement,
    /// A tag has no `=` between key and value.
    #[error("tag {0:?} has no value")]
    MissingTagValue(String),
    /// A tag has an empty key.
    #[error("empty tag key")]
    EmptyTagKey,
}

/// Builds a composite key from a series key and a field name.
pub fn composite_key(series: &str, field: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(series.len() + FIELD_SEPARATOR.len() + field.len());
    key.extend_from_slice(series.as_bytes());
    key.extend_from_slice(FIELD_SEPARATOR);
    key.extend_from_slice(field.as_bytes());
    key
}

/// Splits a composite key into its series and field parts.
///
/// The split happens at the last separator, so a field name never contains
/// the separator while a series key may.
pub fn series_and_field(key: &[u8]) -> Option<(&[u8], &[u8])> {
    let sep = FIELD_SEPARATOR.len();
    if key.len() < sep {
        return None;
    }
    (0..=key.len() - sep)
        .rev()
        .find(|&i| &key[i..i + sep] == FIELD_SEPARATOR)
        .map(|i| (&key[..i], &key[i + sep..]))
}

/// A single tag of a series key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key, unescaped.
    pub key: String,
    /// Tag value, unescaped.
    pub value: String,
}

/// A parsed series key: measurement and tags in stored order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesKey {
    /// Measurement name, unescaped.
    pub measurement: String,
    /// Tags in the order they appear in the key.
    pub tags: Vec<Tag>,
}

impl SeriesKey {
    /// Parses the series portion of a composite key.
    ///
    /// Commas, equals signs, spaces and backslashes may be escaped with a
    /// backslash. Escapes are removed from the parsed parts.
    pub fn parse(series: &[u8]) -> Result<Self, KeyError> {
        let series = std::str::from_utf8(series).map_err(|_| KeyError::InvalidUtf8)?;
        let mut parts = split_unescaped(series, ',').into_iter();

        let measurement = unescape(parts.next().unwrap_or_default());
        if measurement.is_empty() {
            return Err(KeyError::EmptyMeasurement);
        }

        let mut tags = Vec::new();
        for raw in parts {
            let (key, value) = split_once_unescaped(raw, '=')
                .ok_or_else(|| KeyError::MissingTagValue(unescape(raw)))?;
            if key.is_empty() {
                return Err(KeyError::EmptyTagKey);
            }
            tags.push(Tag {
                key: unescape(key),
                value: unescape(value),
            });
        }

        Ok(Self { measurement, tags })
    }

    /// Parses the series key out of a composite key.
    pub fn from_composite(key: &[u8]) -> Result<Self, KeyError> {
        let (series, _field) = series_and_field(key).ok_or(KeyError::MissingField)?;
        Self::parse(series)
    }

    /// Renders the canonical `measurement,k1=v1,k2=v2` form used for matching.
    ///
    /// A series without tags renders as the bare measurement, `cpu`, with no
    /// trailing comma. Filter lines written as `cpu,` do not match it.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.measurement)?;
        for tag in &self.tags {
            write!(f, ",{}={}", tag.key, tag.value)?;
        }
        Ok(())
    }
}

/// Splits at every unescaped `delim`, returning raw (still escaped) parts.
fn split_unescaped(s: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == delim {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn split_once_unescaped(s: &str, delim: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == delim {
            return Some((&s[..i], &s[i + c.len_utf8()..]));
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if matches!(next, ',' | '=' | ' ' | '\\') {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}
