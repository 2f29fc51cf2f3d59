//! Ordered, case-insensitive HTTP header multimap
//!
//! Header names compare case-insensitively but keep the casing they were
//! inserted with, so proxied messages go back out the way they came in.
//! Insertion order is preserved; `set` replaces every occurrence of a name
//! at the position of the first one.

use std::fmt;
use std::sync::Arc;

/// One header entry with its original casing
#[derive(Debug, Clone, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Case-insensitive name match
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl PartialEq for Header {
    /// Names compare case-insensitively, values exactly
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.value == other.value
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Ordered multimap of HTTP headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// First value for `name`, if any
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.is_named(name))
            .map(Header::value)
    }

    /// All values for `name`, in insertion order
    #[must_use]
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|h| h.is_named(name))
            .map(Header::value)
            .collect()
    }

    /// Append a header, keeping any existing values for the same name
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header::new(name, value));
    }

    /// Replace every value of `name` with a single value
    ///
    /// The new entry takes the position of the first existing one so header
    /// order stays stable; if the name was absent it is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|h| h.is_named(&name)) {
            Some(first) => {
                self.entries[first] = Header::new(name.clone(), value);
                self.entries
                    .retain_from(first + 1, |h| !h.is_named(&name));
            }
            None => self.entries.push(Header::new(name, value)),
        }
    }

    /// Add only when the name is not already present
    pub fn set_if_absent(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.entries.push(Header::new(name, value.into()));
        }
    }

    /// Remove every value of `name`; returns true when anything was removed
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|h| !h.is_named(name));
        self.entries.len() != before
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|h| h.is_named(name))
    }

    /// Whether `name` carries exactly `value` (value compared exactly)
    #[must_use]
    pub fn contains_value(&self, name: &str, value: &str) -> bool {
        self.entries
            .iter()
            .any(|h| h.is_named(name) && h.value() == value)
    }

    /// Total number of entries (not distinct names)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    /// Distinct lower-cased names, first-seen order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for h in &self.entries {
            let lower = h.name().to_ascii_lowercase();
            if !seen.contains(&lower) {
                seen.push(lower);
            }
        }
        seen
    }

    /// Shared immutable snapshot of the current state
    ///
    /// The snapshot cannot be mutated through any API; later mutation of
    /// `self` does not affect it.
    #[must_use]
    pub fn immutable_copy(&self) -> Arc<Headers> {
        Arc::new(self.clone())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| Header::new(name, value))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

trait RetainFrom<T> {
    fn retain_from(&mut self, start: usize, keep: impl FnMut(&T) -> bool);
}

impl<T> RetainFrom<T> for Vec<T> {
    /// `Vec::retain` over `self[start..]` only
    fn retain_from(&mut self, start: usize, mut keep: impl FnMut(&T) -> bool) {
        let mut i = start;
        while i < self.len() {
            if keep(&self[i]) {
                i += 1;
            } else {
                self.remove(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_first() {
        let mut headers = Headers::new();
        headers.add("Host", "api.example.com");
        assert_eq!(headers.first("host"), Some("api.example.com"));
        assert_eq!(headers.first("HOST"), Some("api.example.com"));
        assert_eq!(headers.first("x-missing"), None);
    }

    #[test]
    fn test_add_keeps_duplicates_in_order() {
        let mut headers = Headers::new();
        headers.add("Set-Cookie", "a=1");
        headers.add("Set-Cookie", "b=2");
        assert_eq!(headers.all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_set_replaces_all_occurrences() {
        let mut headers = Headers::new();
        headers.add("Accept", "text/html");
        headers.add("X-Other", "1");
        headers.add("accept", "application/json");
        headers.set("Accept", "*/*");

        assert_eq!(headers.all("accept"), vec!["*/*"]);
        assert_eq!(headers.len(), 2);
        // Replacement keeps the first occurrence's position
        assert_eq!(headers.iter().next().unwrap().value(), "*/*");
    }

    #[test]
    fn test_set_appends_when_absent() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "12");
        assert_eq!(headers.first("content-length"), Some("12"));
    }

    #[test]
    fn test_set_if_absent() {
        let mut headers = Headers::new();
        headers.add("Host", "a");
        headers.set_if_absent("Host", "b");
        headers.set_if_absent("X-New", "c");
        assert_eq!(headers.first("host"), Some("a"));
        assert_eq!(headers.first("x-new"), Some("c"));
    }

    #[test]
    fn test_remove() {
        let mut headers = Headers::new();
        headers.add("X-Forwarded-For", "1.2.3.4");
        headers.add("x-forwarded-for", "5.6.7.8");
        headers.add("Host", "x");

        assert!(headers.remove("X-FORWARDED-FOR"));
        assert!(!headers.contains("x-forwarded-for"));
        assert_eq!(headers.len(), 1);
        assert!(!headers.remove("x-forwarded-for"));
    }

    #[test]
    fn test_preserves_original_casing() {
        let mut headers = Headers::new();
        headers.add("X-Request-ID", "abc");
        let entry = headers.iter().next().unwrap();
        assert_eq!(entry.name(), "X-Request-ID");
    }

    #[test]
    fn test_contains_value() {
        let mut headers = Headers::new();
        headers.add("Connection", "keep-alive");
        assert!(headers.contains_value("connection", "keep-alive"));
        assert!(!headers.contains_value("connection", "close"));
    }

    #[test]
    fn test_names_distinct_lowercase() {
        let mut headers = Headers::new();
        headers.add("Host", "x");
        headers.add("HOST", "y");
        headers.add("Accept", "*/*");
        assert_eq!(headers.names(), vec!["host", "accept"]);
    }

    #[test]
    fn test_clone_is_decoupled() {
        let mut original = Headers::new();
        original.add("Host", "a");
        let mut copy = original.clone();
        copy.set("Host", "b");

        assert_eq!(original.first("host"), Some("a"));
        assert_eq!(copy.first("host"), Some("b"));
    }

    #[test]
    fn test_immutable_copy_unaffected_by_mutation() {
        let mut headers = Headers::new();
        headers.add("Host", "a");
        let snapshot = headers.immutable_copy();

        headers.set("Host", "b");
        headers.add("X-New", "1");

        assert_eq!(snapshot.first("host"), Some("a"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_equality_ignores_name_case() {
        let mut a = Headers::new();
        a.add("Host", "x");
        let mut b = Headers::new();
        b.add("host", "x");
        assert_eq!(a, b);

        let mut c = Headers::new();
        c.add("Host", "y");
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_iterator() {
        let headers: Headers = vec![
            ("Host".to_string(), "x".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.first("host"), Some("x"));
    }
}
