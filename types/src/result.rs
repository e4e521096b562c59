use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::content::Content;
use crate::error::FetchError;
use crate::headers::Headers;

/// Status code reserved to mean "transport-layer failure", distinct from any upstream HTTP
/// response the origin server might have sent.
pub const TRANSPORT_FAILURE_STATUS: u16 = 599;

/// The uniform response envelope. Every invocation of the fetcher produces exactly one of these,
/// never an exception to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub status_code: u16,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub orig_url: String,
    #[serde(default)]
    pub content: Content,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub save: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl FetchResult {
    /// Build a result from a [`FetchError`] produced partway through a fetch: `content` is
    /// empty, `status_code` is 599 or the preserved HTTP status, and the error is stringified
    /// for the wire per the propagation rule — `FetchError` itself never crosses this boundary.
    #[must_use]
    pub fn from_error(orig_url: impl Into<String>, error: &FetchError, elapsed_secs: f64) -> Self {
        let orig_url = orig_url.into();
        Self {
            status_code: error.status_code(),
            url: orig_url.clone(),
            orig_url,
            content: Content::default(),
            headers: Headers::default(),
            cookies: BTreeMap::new(),
            time: elapsed_secs,
            save: None,
            error: Some(error.message.clone()),
            traceback: None,
        }
    }

    #[must_use]
    pub fn synthetic(
        status_code: u16,
        orig_url: impl Into<String>,
        content: impl Into<Content>,
        error: Option<String>,
    ) -> Self {
        let orig_url = orig_url.into();
        Self {
            status_code,
            url: orig_url.clone(),
            orig_url,
            content: content.into(),
            headers: Headers::default(),
            cookies: BTreeMap::new(),
            time: 0.0,
            save: None,
            error,
            traceback: None,
        }
    }

    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        self.status_code == TRANSPORT_FAILURE_STATUS
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn from_error_uses_599_for_non_http_kinds() {
        let err = FetchError::timeout("deadline exceeded");
        let result = FetchResult::from_error("http://example.com", &err, 1.0);
        assert_eq!(result.status_code, 599);
        assert_eq!(result.error.as_deref(), Some("deadline exceeded"));
        assert!(result.content.is_empty());
    }

    #[test]
    fn from_error_preserves_http_status() {
        let err = FetchError::new(ErrorKind::Http(404), "not found");
        let result = FetchResult::from_error("http://example.com", &err, 0.1);
        assert_eq!(result.status_code, 404);
    }

    #[test]
    fn minimal_remote_backend_response_deserializes() {
        let result: FetchResult = serde_json::from_str(r#"{"status_code":200}"#).unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.url, "");
        assert_eq!(result.time, 0.0);
    }

    #[test]
    fn synthetic_result_has_zero_elapsed_time() {
        let result = FetchResult::synthetic(403, "http://example.com", "Disallowed by robots.txt", Some("Disallowed by robots.txt".into()));
        assert_eq!(result.status_code, 403);
        assert_eq!(result.time, 0.0);
    }
}
