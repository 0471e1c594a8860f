//! HTTP header and cookie collections
//!
//! Both keep (name, value) pairs in arrival order. Duplicates are allowed
//! and lookups return the first match. Header names compare
//! case-insensitively, cookie names exactly.

use std::fmt;

/// Ordered name/value pairs
///
/// `FOLD_CASE` selects ASCII case-insensitive name matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields<const FOLD_CASE: bool> {
    entries: Vec<(String, String)>,
}

/// Request or response headers
pub type Headers = Fields<true>;

/// Cookies from `Cookie` or `Set-Cookie` headers
pub type Cookies = Fields<false>;

impl<const FOLD_CASE: bool> Fields<FOLD_CASE> {
    pub const fn new() -> Self {
        Fields { entries: Vec::new() }
    }

    fn matches(stored: &str, wanted: &str) -> bool {
        if FOLD_CASE {
            stored.eq_ignore_ascii_case(wanted)
        } else {
            stored == wanted
        }
    }

    /// Append a pair, keeping any earlier value with the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value stored under `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter().find(|(n, _)| Self::matches(n, name)).map(|(_, v)| v)
    }

    /// Every value stored under `name`, oldest first
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.iter()
            .filter(|(n, _)| Self::matches(n, name))
            .map(|(_, v)| v)
            .collect()
    }

    pub fn get_index(&self, index: usize) -> Option<(&str, &str)> {
        self.entries.get(index).map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<const FOLD_CASE: bool> fmt::Display for Fields<FOLD_CASE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if FOLD_CASE { ": " } else { "=" };
        for (name, value) in self.iter() {
            writeln!(f, "{}{}{}", name, separator, value)?;
        }
        Ok(())
    }
}

impl<const FOLD_CASE: bool> FromIterator<(String, String)> for Fields<FOLD_CASE> {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Fields {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.insert("Upgrade", "websocket");
        headers.insert("Sec-WebSocket-Version", "13");

        assert_eq!(headers.get("upgrade"), Some("websocket"));
        assert_eq!(headers.get("SEC-WEBSOCKET-VERSION"), Some("13"));
        assert!(headers.contains("sec-websocket-version"));
        assert_eq!(headers.get("Origin"), None);
    }

    #[test]
    fn test_duplicate_headers_keep_arrival_order() {
        let mut headers = Headers::new();
        headers.insert("Via", "edge-1");
        headers.insert("Host", "game.example.com");
        headers.insert("via", "edge-2");

        assert_eq!(headers.get("Via"), Some("edge-1"));
        assert_eq!(headers.get_all("VIA"), vec!["edge-1", "edge-2"]);
        assert_eq!(headers.get_index(1), Some(("Host", "game.example.com")));
        assert_eq!(headers.get_index(3), None);
        assert_eq!(headers.to_string(), "Via: edge-1\nHost: game.example.com\nvia: edge-2\n");
    }

    #[test]
    fn test_cookie_names_are_exact() {
        let mut cookies = Cookies::new();
        cookies.insert("session", "abc");
        cookies.insert("Session", "def");
        cookies.insert("session", "ghi");

        assert_eq!(cookies.get("session"), Some("abc"));
        assert_eq!(cookies.get("Session"), Some("def"));
        assert_eq!(cookies.get("SESSION"), None);
        assert_eq!(cookies.len(), 3);

        cookies.clear();
        assert!(cookies.is_empty());
    }

    #[test]
    fn test_collect_from_pairs() {
        let cookies: Cookies = vec![("region".to_string(), "eu".to_string())].into_iter().collect();
        assert_eq!(cookies.to_string(), "region=eu\n");
    }
}
