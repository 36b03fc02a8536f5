//! The set of series keys selected for deletion.

use crate::error::Result;
use finl_unicode::categories::CharacterCategories;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// Series keys to delete, matched exactly against block series keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesFilter {
    keys: HashSet<String>,
}

impl SeriesFilter {
    /// Loads a filter from a file holding one series key per line.
    ///
    /// Lines are taken verbatim apart from the `\n` or `\r\n` terminator, so
    /// surrounding whitespace is part of the key. Duplicate lines collapse.
    /// With `sanitize`, keys containing non-printable characters are left out
    /// of the set, so blocks carrying them are never dropped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened or read, including
    /// `InvalidData` for input that is not UTF-8.
    pub fn load(path: &Path, sanitize: bool) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut filter = Self::default();
        let mut excluded = 0usize;

        for line in reader.lines() {
            let line = line?;
            if sanitize && !is_printable(&line) {
                excluded += 1;
                continue;
            }
            filter.keys.insert(line);
        }

        if excluded > 0 {
            warn!(
                "Excluded {} series keys with non-printable characters from {}",
                excluded,
                path.display()
            );
        }
        for key in &filter.keys {
            debug!("Series selected for deletion: {}", key);
        }

        Ok(filter)
    }

    /// Builds a filter from in-memory keys.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `series_key` is selected for deletion.
    pub fn contains(&self, series_key: &str) -> bool {
        self.keys.contains(series_key)
    }

    /// Returns the number of distinct keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if nothing is selected.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates over the selected keys in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// Returns true if every character of `s` is a letter, mark, number,
/// punctuation or symbol, or the ASCII space.
///
/// Other separators (NBSP, em space, ideographic space), control, format,
/// private-use and unassigned code points make the string non-printable.
pub fn is_printable(s: &str) -> bool {
    s.chars().all(|c| {
        c == ' '
            || c.is_letter()
            || c.is_mark()
            || c.is_number()
            || c.is_punctuation()
            || c.is_symbol()
    })
}
