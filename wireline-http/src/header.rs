use std::collections::{BTreeMap, BTreeSet};

/// A case-insensitive, multi-valued header map.
///
/// Keys are stored in canonical form: the first letter and every letter
/// following a `-` uppercased, everything else lowercased. Enumeration
/// order is stable (sorted by canonical key).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: BTreeMap<String, BTreeSet<String>>,
}

impl Header {
    pub fn new() -> Header {
        Header::default()
    }

    /// Canonicalize a header key. Idempotent.
    pub fn canonicalize_key(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        let mut capitalize = true;
        for c in key.chars() {
            let c = if capitalize {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            capitalize = c == '-';
            out.push(c);
        }
        out
    }

    /// Whether any value is stored under `key`.
    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(&Self::canonicalize_key(key))
    }

    /// Whether `value` is stored under `key`.
    pub fn has_value(&self, key: &str, value: &str) -> bool {
        self.fields
            .get(&Self::canonicalize_key(key))
            .is_some_and(|values| values.contains(value))
    }

    /// Insert `value` into the set stored under `key`.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.fields
            .entry(Self::canonicalize_key(key))
            .or_default()
            .insert(value.into());
    }

    /// Replace the whole set stored under `key` with the single `value`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let mut values = BTreeSet::new();
        values.insert(value.into());
        self.fields.insert(Self::canonicalize_key(key), values);
    }

    /// Erase the entry for `key`.
    pub fn remove(&mut self, key: &str) {
        self.fields.remove(&Self::canonicalize_key(key));
    }

    /// Erase one value; the key stays iff other values remain.
    pub fn remove_value(&mut self, key: &str, value: &str) {
        let canonical = Self::canonicalize_key(key);
        if let Some(values) = self.fields.get_mut(&canonical) {
            values.remove(value);
            if values.is_empty() {
                self.fields.remove(&canonical);
            }
        }
    }

    /// All values stored under `key`.
    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.fields.get(&Self::canonicalize_key(key))
    }

    /// The first value stored under `key` (by set order).
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|values| values.iter().next())
            .map(String::as_str)
    }

    /// Call `f(key, values)` for every stored key.
    pub fn enumerate(&self, mut f: impl FnMut(&str, &BTreeSet<String>)) {
        for (key, values) in &self.fields {
            f(key, values);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Emit the wire form: one `Key: value\r\n` line per value.
    pub fn write_wire(&self, out: &mut Vec<u8>) {
        for (key, values) in &self.fields {
            for value in values {
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
    }

    /// Parse one incoming header line: strip the trailing CRLF, split on the
    /// first `:`, trim surrounding whitespace. Lines without `:` (the status
    /// line, the blank terminator) yield `None`.
    pub fn parse_line(line: &[u8]) -> Option<(String, String)> {
        let text = std::str::from_utf8(line).ok()?;
        let text = text.trim_end_matches(['\r', '\n']);
        let (key, value) = text.split_once(':')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key.to_string(), value.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization() {
        assert_eq!(Header::canonicalize_key("content-type"), "Content-Type");
        assert_eq!(Header::canonicalize_key("CONTENT-LENGTH"), "Content-Length");
        assert_eq!(Header::canonicalize_key("x-my-header"), "X-My-Header");
        assert_eq!(Header::canonicalize_key("etag"), "Etag");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for key in ["content-type", "WWW-Authenticate", "x--odd", "a1-b2"] {
            let once = Header::canonicalize_key(key);
            assert_eq!(Header::canonicalize_key(&once), once);
        }
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let mut header = Header::new();
        header.add("content-type", "text/plain");
        assert!(header.has("Content-Type"));
        assert!(header.has("CONTENT-TYPE"));
        assert!(header.has_value("content-TYPE", "text/plain"));
        assert!(!header.has_value("content-type", "text/html"));
    }

    #[test]
    fn add_accumulates_set_replaces() {
        let mut header = Header::new();
        header.add("accept", "text/html");
        header.add("accept", "application/json");
        assert_eq!(header.get("Accept").unwrap().len(), 2);

        header.set("accept", "*/*");
        assert_eq!(header.get("Accept").unwrap().len(), 1);
        assert!(header.has_value("accept", "*/*"));
    }

    #[test]
    fn remove_value_keeps_key_with_remaining_values() {
        let mut header = Header::new();
        header.add("via", "a");
        header.add("via", "b");
        header.remove_value("via", "a");
        assert!(header.has("via"));
        header.remove_value("via", "b");
        assert!(!header.has("via"));
    }

    #[test]
    fn enumerate_visits_every_key() {
        let mut header = Header::new();
        header.add("b", "2");
        header.add("a", "1");
        let mut seen = Vec::new();
        header.enumerate(|key, _| seen.push(key.to_string()));
        assert_eq!(seen, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn wire_emission_includes_empty_values() {
        let mut header = Header::new();
        header.add("empty", "");
        header.add("test1", "42");
        let mut out = Vec::new();
        header.write_wire(&mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Empty: \r\n"));
        assert!(text.contains("Test1: 42\r\n"));
    }

    #[test]
    fn parse_line_trims_and_splits_on_first_colon() {
        let (key, value) = Header::parse_line(b"Content-Type: text/plain\r\n").unwrap();
        assert_eq!(key, "Content-Type");
        assert_eq!(value, "text/plain");

        // Only the first colon splits.
        let (key, value) = Header::parse_line(b"Date: Thu, 01 Jan 1970 00:00:00 GMT\r\n").unwrap();
        assert_eq!(key, "Date");
        assert_eq!(value, "Thu, 01 Jan 1970 00:00:00 GMT");

        // Empty value survives as the empty string.
        let (key, value) = Header::parse_line(b"Empty: \r\n").unwrap();
        assert_eq!(key, "Empty");
        assert_eq!(value, "");
    }

    #[test]
    fn parse_line_ignores_lines_without_colon() {
        assert!(Header::parse_line(b"HTTP/1.1 200 OK\r\n").is_none());
        assert!(Header::parse_line(b"\r\n").is_none());
    }
}
