//! Resource keys: the cache's addressing scheme.
//!
//! A key is an ordered list of text/number segments such as
//! `["schedule", 42]`. Keys serialise as plain JSON arrays.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator used when joining segments into the canonical form.
const SEGMENT_SEPARATOR: char = '/';

/// Escape prefix for text that would otherwise be ambiguous.
const ESCAPE: char = '%';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Number(i64),
    Text(String),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Number(n) => write!(f, "{}", n),
            KeySegment::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(s: &str) -> Self {
        KeySegment::Text(s.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(s: String) -> Self {
        KeySegment::Text(s)
    }
}

impl From<i64> for KeySegment {
    fn from(n: i64) -> Self {
        KeySegment::Number(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(Vec<KeySegment>);

impl ResourceKey {
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    /// Build a key from CLI-style words: purely numeric words become number
    /// segments, everything else text.
    pub fn parse_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            words
                .into_iter()
                .map(|w| {
                    let w = w.as_ref();
                    match w.parse::<i64>() {
                        Ok(n) => KeySegment::Number(n),
                        Err(_) => KeySegment::Text(w.to_string()),
                    }
                })
                .collect(),
        )
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    /// Append a segment, builder style.
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Segments joined in order. Used for coalescing, store addressing and
    /// invalidation-pattern matching.
    ///
    /// Distinct keys never share a canonical form: number segments are plain
    /// decimal, while text segments escape `%` and `/`, and also their first
    /// character when the text alone would read as a number (`"1"` becomes
    /// `%31`). An empty text segment is a bare `%`.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(SEGMENT_SEPARATOR);
            }
            match segment {
                KeySegment::Number(n) => out.push_str(&n.to_string()),
                KeySegment::Text(text) => push_escaped(&mut out, text),
            }
        }
        out
    }

    /// First text segment, which names the resource domain.
    pub fn domain(&self) -> Option<&str> {
        match self.0.first() {
            Some(KeySegment::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_descendant_of(&self, prefix: &ResourceKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Substring match against the canonical form, so "schedule" also hits
    /// "schedule-analytics/..." keys.
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        self.canonical().contains(pattern)
    }
}

fn push_escaped(out: &mut String, text: &str) {
    if text.is_empty() {
        out.push(ESCAPE);
        return;
    }
    let numeric = text.parse::<i64>().is_ok();
    for (i, c) in text.chars().enumerate() {
        if c == ESCAPE || c == SEGMENT_SEPARATOR || (numeric && i == 0) {
            out.push_str(&format!("{}{:02X}", ESCAPE, c as u32));
        } else {
            out.push(c);
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// `resource_key!["schedule", 42]`
#[macro_export]
macro_rules! resource_key {
    ($($segment:expr),* $(,)?) => {
        $crate::key::ResourceKey::new(vec![$($crate::key::KeySegment::from($segment)),*])
    };
}
