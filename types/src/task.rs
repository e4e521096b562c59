use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::TaskId;

/// Which backend a task should be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchType {
    Http,
    Puppeteer,
    Playwright,
    PyPlaywright,
    Splash,
}

impl FetchType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FetchType::Http => "http",
            FetchType::Puppeteer => "puppeteer",
            FetchType::Playwright => "playwright",
            FetchType::PyPlaywright => "py_playwright",
            FetchType::Splash => "splash",
        }
    }
}

/// Resolve a raw `fetch_type` string into a backend plus whether the value is a legacy alias.
///
/// `js` and `phantomjs` are accepted for backwards compatibility and silently routed to
/// `puppeteer`; the caller is expected to log the one-time deprecation notice, since logging
/// is an I/O concern this pure function does not own.
#[must_use]
pub fn resolve_fetch_type(raw: Option<&str>) -> (FetchType, bool) {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") | Some("http") => (FetchType::Http, false),
        Some("puppeteer") => (FetchType::Puppeteer, false),
        Some("playwright") => (FetchType::Playwright, false),
        Some("py_playwright") => (FetchType::PyPlaywright, false),
        Some("splash") => (FetchType::Splash, false),
        Some("js" | "phantomjs") => (FetchType::Puppeteer, true),
        Some(_) => (FetchType::Http, false),
    }
}

/// Prior-attempt metadata the scheduler hands back on a re-fetch, used to build conditional
/// request headers (`If-None-Match` / `If-Modified-Since`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackFetch {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub ok: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub fetch: Option<TrackFetch>,
}

/// The per-task fetch configuration: `task.fetch` in the external schema.
///
/// Every field is optional on the wire; [`FetchConfig`] exposes accessor methods that apply the
/// documented default for any field left unset, following this codebase's `Option<T>` field +
/// `DEFAULT_*` const + accessor pattern for wire-facing config structs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub cookies: Option<BTreeMap<String, String>>,
    #[serde(default, alias = "data")]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub connect_timeout: Option<f64>,
    #[serde(default)]
    pub allow_redirects: Option<bool>,
    #[serde(default)]
    pub max_redirects: Option<u32>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub robots_txt: Option<bool>,
    /// Per-task override of the engine-wide TLS verification default. `None` defers to whatever
    /// the transport engine was configured with; `Some(false)` disables verification for this
    /// task only, `Some(true)` forces it on even if the engine default is off.
    #[serde(default)]
    pub verify_tls: Option<bool>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub fetch_type: Option<String>,
    #[serde(default)]
    pub save: Option<serde_json::Value>,
    /// Backend-specific sub-configs (e.g. a splash `lua_source` override, a playwright
    /// `wait_for_selector`) that this process does not interpret but must forward verbatim to
    /// the remote browser-proxy backend.
    #[serde(flatten)]
    pub backend_options: serde_json::Map<String, serde_json::Value>,
}

impl FetchConfig {
    pub const DEFAULT_METHOD: &'static str = "GET";
    pub const DEFAULT_TIMEOUT_SECS: f64 = 120.0;
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 20.0;
    pub const DEFAULT_ALLOW_REDIRECTS: bool = true;
    pub const DEFAULT_MAX_REDIRECTS: u32 = 5;
    pub const DEFAULT_ROBOTS_TXT: bool = false;

    #[must_use]
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or(Self::DEFAULT_METHOD)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT_SECS).max(0.0))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.connect_timeout
                .unwrap_or(Self::DEFAULT_CONNECT_TIMEOUT_SECS)
                .max(0.0),
        )
    }

    #[must_use]
    pub fn allow_redirects(&self) -> bool {
        self.allow_redirects.unwrap_or(Self::DEFAULT_ALLOW_REDIRECTS)
    }

    #[must_use]
    pub fn max_redirects(&self) -> u32 {
        self.max_redirects.unwrap_or(Self::DEFAULT_MAX_REDIRECTS)
    }

    #[must_use]
    pub fn robots_txt(&self) -> bool {
        self.robots_txt.unwrap_or(Self::DEFAULT_ROBOTS_TXT)
    }

    /// Resolve this task's TLS verification setting against the engine-wide default. `None`
    /// (the common case) defers entirely to `engine_default`.
    #[must_use]
    pub fn verify_tls(&self, engine_default: bool) -> bool {
        self.verify_tls.unwrap_or(engine_default)
    }

    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    #[must_use]
    pub fn fetch_type(&self) -> (FetchType, bool) {
        resolve_fetch_type(self.fetch_type.as_deref())
    }

    /// The etag to send as `If-None-Match`: an explicit literal takes precedence over the
    /// tracked value from a prior successful fetch.
    #[must_use]
    pub fn effective_etag<'a>(&'a self, track: Option<&'a Track>) -> Option<&'a str> {
        self.etag.as_deref().or_else(|| {
            track
                .and_then(|t| t.fetch.as_ref())
                .filter(|f| f.ok.unwrap_or(false))
                .and_then(|f| f.etag.as_deref())
        })
    }

    #[must_use]
    pub fn effective_last_modified<'a>(&'a self, track: Option<&'a Track>) -> Option<&'a str> {
        self.last_modified.as_deref().or_else(|| {
            track
                .and_then(|t| t.fetch.as_ref())
                .filter(|f| f.ok.unwrap_or(false))
                .and_then(|f| f.last_modified.as_deref())
        })
    }
}

/// The unit of work handed to the fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub taskid: TaskId,
    pub project: String,
    pub url: String,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub track: Option<Track>,
}

impl Task {
    #[must_use]
    pub fn new(taskid: impl Into<TaskId>, project: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            taskid: taskid.into(),
            project: project.into(),
            url: url.into(),
            fetch: FetchConfig::default(),
            track: None,
        }
    }

    #[must_use]
    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_fetch_types_route_to_puppeteer() {
        assert_eq!(resolve_fetch_type(Some("js")), (FetchType::Puppeteer, true));
        assert_eq!(
            resolve_fetch_type(Some("phantomjs")),
            (FetchType::Puppeteer, true)
        );
        assert_eq!(
            resolve_fetch_type(Some("puppeteer")),
            (FetchType::Puppeteer, false)
        );
    }

    #[test]
    fn unset_fetch_type_defaults_to_http() {
        assert_eq!(resolve_fetch_type(None), (FetchType::Http, false));
    }

    #[test]
    fn defaults_apply_when_fields_are_unset() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.method(), "GET");
        assert_eq!(fetch.max_redirects(), 5);
        assert!(fetch.allow_redirects());
        assert!(!fetch.robots_txt());
    }

    #[test]
    fn verify_tls_defers_to_engine_default_unless_overridden() {
        let fetch = FetchConfig::default();
        assert!(fetch.verify_tls(true));
        assert!(!fetch.verify_tls(false));

        let fetch = FetchConfig {
            verify_tls: Some(false),
            ..FetchConfig::default()
        };
        assert!(!fetch.verify_tls(true));
    }

    #[test]
    fn effective_etag_prefers_literal_over_track() {
        let track = Track {
            fetch: Some(TrackFetch {
                etag: Some("tracked".into()),
                last_modified: None,
                ok: Some(true),
            }),
        };
        let mut fetch = FetchConfig::default();
        assert_eq!(fetch.effective_etag(Some(&track)), Some("tracked"));
        fetch.etag = Some("literal".into());
        assert_eq!(fetch.effective_etag(Some(&track)), Some("literal"));
    }

    #[test]
    fn effective_etag_ignores_track_from_failed_attempt() {
        let track = Track {
            fetch: Some(TrackFetch {
                etag: Some("stale".into()),
                last_modified: None,
                ok: Some(false),
            }),
        };
        let fetch = FetchConfig::default();
        assert_eq!(fetch.effective_etag(Some(&track)), None);
    }
}
