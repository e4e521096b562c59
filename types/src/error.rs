use serde::Serialize;
use thiserror::Error;

/// The small set of failure kinds a fetch can converge to.
///
/// `Http` carries the upstream status only when the caller explicitly asked for non-2xx/3xx
/// statuses to be surfaced as errors; ordinary non-2xx responses are not errors and flow through
/// as a successful [`crate::FetchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Dns,
    Ssl,
    Proxy,
    Http(u16),
    Network,
    Parse,
    Script,
}

impl ErrorKind {
    /// Every `fetch_error_<kind>` suffix this taxonomy can produce, for callers (the RPC
    /// `counter()` bridge) that need to sum across all error kinds without enumerating variants.
    pub const ALL_SUFFIXES: [&'static str; 8] =
        ["timeout", "dns", "ssl", "proxy", "http", "network", "parse", "script"];

    /// The metric-name suffix used for `fetch_error_<kind>` counters.
    #[must_use]
    pub fn metric_suffix(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Dns => "dns",
            ErrorKind::Ssl => "ssl",
            ErrorKind::Proxy => "proxy",
            ErrorKind::Http(_) => "http",
            ErrorKind::Network => "network",
            ErrorKind::Parse => "parse",
            ErrorKind::Script => "script",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Http(status) => write!(f, "http({status})"),
            other => f.write_str(other.metric_suffix()),
        }
    }
}

/// Ordered `(key, value)` detail pairs attached to a [`FetchError`].
///
/// Kept as an ordered vector rather than a map so detail order is stable in logs and in the
/// `to_json` encoding, matching how detail pairs read in this codebase's other request errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetails(Vec<(String, String)>);

impl ErrorDetails {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    #[must_use]
    pub fn as_slice(&self) -> &[(String, String)] {
        &self.0
    }
}

impl Serialize for ErrorDetails {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Internal fetch failure. Never crosses the RPC boundary directly: every fetch path converts
/// this into the `error`/`traceback` strings of a [`crate::FetchResult`] before returning.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: ErrorDetails,
}

impl FetchError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: ErrorDetails::new(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn dns(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dns, message)
    }

    #[must_use]
    pub fn ssl(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ssl, message)
    }

    #[must_use]
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Proxy, message)
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// The status code this error should surface as on the wire: 599 for transport failure,
    /// or the preserved HTTP status where that is meaningful (`ErrorKind::Http`).
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::Http(status) => status,
            _ => 599,
        }
    }

    /// Render as the JSON object shape used when this error needs to travel as data (e.g. inside
    /// a browser-proxy error passthrough) rather than as a plain string.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.to_string(),
            "message": self.message,
            "details": self.details,
        })
    }
}
