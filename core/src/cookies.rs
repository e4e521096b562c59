//! Per-fetch cookie jar (used by the transport engine's redirect loop).
//!
//! Grounded on `tornado_fetcher.py`'s `RequestsCookieJar` usage: an inline `Cookie` request
//! header is parsed first, then the task's `fetch.cookies` dict overlays it (dict entries win on
//! conflict), then every redirect hop's response updates the jar before the next request derives
//! its `Cookie` header from the jar alone.

use std::collections::BTreeMap;

use fetchcore_types::Headers;

#[derive(Debug, Clone, Default)]
pub struct CookieJar(BTreeMap<String, String>);

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the jar for the first request of a fetch: parse an inline `Cookie` header, then
    /// overlay `fetch.cookies`.
    #[must_use]
    pub fn from_header_and_dict(
        header_value: Option<&str>,
        dict: Option<&BTreeMap<String, String>>,
    ) -> Self {
        let mut jar = Self::new();
        if let Some(header) = header_value {
            jar.load_header(header);
        }
        if let Some(dict) = dict {
            for (k, v) in dict {
                jar.0.insert(k.clone(), v.clone());
            }
        }
        jar
    }

    fn load_header(&mut self, header: &str) {
        for pair in header.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((name, value)) = pair.split_once('=') {
                self.0.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    /// Merge `Set-Cookie` headers from a response into the jar. Each `Set-Cookie` value may carry
    /// attributes (`Path`, `Expires`, ...) after the first `;`-separated pair; only the
    /// name=value pair is kept, matching `extract_cookies_to_jar`'s name/value extraction.
    pub fn update_from_response(&mut self, headers: &Headers) {
        for (name, value) in headers.iter() {
            if !name.eq_ignore_ascii_case("set-cookie") {
                continue;
            }
            for single in value.split(", ") {
                let Some(name_value) = single.split(';').next() else {
                    continue;
                };
                if let Some((name, value)) = name_value.split_once('=') {
                    self.0.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
    }

    /// The `Cookie` header to send on the next outgoing request, or `None` if the jar is empty.
    #[must_use]
    pub fn as_header_value(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_overlays_header_on_conflict() {
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), "dict-value".to_string());
        let jar = CookieJar::from_header_and_dict(Some("a=header-value; b=1"), Some(&dict));
        let map = jar.into_map();
        assert_eq!(map["a"], "dict-value");
        assert_eq!(map["b"], "1");
    }

    #[test]
    fn set_cookie_header_updates_jar_and_drops_attributes() {
        let mut jar = CookieJar::new();
        let mut headers = Headers::new();
        headers.insert("Set-Cookie", "session=abc123; Path=/; HttpOnly");
        jar.update_from_response(&headers);
        assert_eq!(jar.into_map()["session"], "abc123");
    }

    #[test]
    fn empty_jar_produces_no_cookie_header() {
        let jar = CookieJar::new();
        assert_eq!(jar.as_header_value(), None);
    }

    #[test]
    fn repeated_set_cookie_values_all_merge() {
        let mut jar = CookieJar::new();
        let mut headers = Headers::new();
        headers.insert("Set-Cookie", "a=1");
        headers.insert("Set-Cookie", "b=2");
        jar.update_from_response(&headers);
        let map = jar.into_map();
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], "2");
    }
}
