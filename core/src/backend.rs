//! Backend router (component F).
//!
//! Ported from `tornado_fetcher.py`'s `http_fetch`/`puppeteer_fetch`/`playwright_fetch`/
//! `splash_fetch` dispatch: a remote backend receives the task as a JSON POST (`url` + `headers`
//! plus whatever backend-specific fields the task carried) and its response is returned verbatim
//! after overlaying `time` and `save`. Unlike the source, `splash` dispatches whenever its
//! endpoint is configured — the source's `splash_fetch` returns 501 unconditionally regardless of
//! configuration, which this implementation treats as a bug rather than behavior to preserve.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fetchcore_config::BackendPolicy;
use fetchcore_types::{resolve_fetch_type, ErrorKind, FetchError, FetchResult, FetchType, Task, Track};

use crate::robots::RobotsCache;
use crate::transport::{self, TransportDeps};

static LEGACY_FETCH_TYPE_LOGGED: AtomicBool = AtomicBool::new(false);

pub struct BackendDeps<'a> {
    pub transport: TransportDeps<'a>,
    pub robots: &'a RobotsCache,
    pub puppeteer: &'a BackendPolicy,
    pub playwright: &'a BackendPolicy,
    pub py_playwright: &'a BackendPolicy,
    pub splash: &'a BackendPolicy,
    pub splash_lua_source: &'a str,
}

pub async fn dispatch(task: &Task, track: Option<&Track>, deps: &BackendDeps<'_>) -> FetchResult {
    let (fetch_type, is_legacy) = task.fetch.fetch_type();
    if is_legacy && !LEGACY_FETCH_TYPE_LOGGED.swap(true, Ordering::AcqRel) {
        tracing::warn!(
            raw = ?task.fetch.fetch_type,
            "fetch_type value is deprecated and has been rewritten to 'puppeteer'"
        );
    }

    match fetch_type {
        FetchType::Http => transport::http_fetch(task, track, &deps.transport, None).await,
        FetchType::Puppeteer => dispatch_remote(task, track, deps, deps.puppeteer, "puppeteer", None).await,
        FetchType::Playwright => dispatch_remote(task, track, deps, deps.playwright, "playwright", None).await,
        FetchType::PyPlaywright => {
            dispatch_remote(task, track, deps, deps.py_playwright, "py_playwright", None).await
        }
        FetchType::Splash => {
            dispatch_remote(task, track, deps, deps.splash, "splash", Some(deps.splash_lua_source)).await
        }
    }
}

async fn dispatch_remote(
    task: &Task,
    _track: Option<&Track>,
    deps: &BackendDeps<'_>,
    policy: &BackendPolicy,
    name: &str,
    lua_source: Option<&str>,
) -> FetchResult {
    let Some(endpoint) = policy.endpoint() else {
        tracing::warn!(backend = name, project = %task.project, taskid = %task.taskid, url = %task.url, "backend not enabled");
        return FetchResult::synthetic(501, &task.url, format!("{name} is not enabled."), None);
    };

    if task.fetch.robots_txt() {
        let Ok(url) = url::Url::parse(&task.url) else {
            return FetchResult::from_error(&task.url, &FetchError::new(ErrorKind::Parse, "invalid URL"), 0.0);
        };
        let user_agent = task.fetch.user_agent().unwrap_or("fetchcore");
        if !deps.robots.allowed(&url, user_agent).await {
            return FetchResult::synthetic(403, &task.url, "", Some("Disallowed by robots.txt".to_string()));
        }
    }

    let started = Instant::now();

    let mut body = serde_json::json!({
        "url": task.url,
        "headers": task.fetch.headers.clone().unwrap_or_default(),
        "method": task.fetch.method(),
    });
    if let Some(lua_source) = lua_source {
        body["lua_source"] = serde_json::Value::String(lua_source.to_string());
    }
    if let serde_json::Value::Object(map) = &mut body {
        for (k, v) in &task.fetch.backend_options {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    let connect_timeout = task.fetch.connect_timeout() + Duration::from_secs(20);
    let request_timeout = task.fetch.timeout() + Duration::from_secs(1);

    let response = deps
        .transport
        .client
        .post(endpoint.clone())
        .timeout(connect_timeout + request_timeout)
        .json(&body)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            let err = FetchError::network(format!("{name} backend request failed: {e}"));
            return remote_error_outcome(deps, &task.url, &err, started.elapsed().as_secs_f64());
        }
    };

    let raw = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            let err = FetchError::network(format!("{name} backend response read failed: {e}"));
            return remote_error_outcome(deps, &task.url, &err, started.elapsed().as_secs_f64());
        }
    };

    let mut result: FetchResult = match serde_json::from_slice(&raw) {
        Ok(r) => r,
        Err(e) => {
            let err = FetchError::new(ErrorKind::Parse, format!("{name} backend returned an unparseable response: {e}"));
            return remote_error_outcome(deps, &task.url, &err, started.elapsed().as_secs_f64());
        }
    };

    result.time = started.elapsed().as_secs_f64();
    result.save = task.fetch.save.clone();

    if result.is_success() {
        deps.transport.metrics.increment("fetch_success", 1, &[]);
        tracing::info!(status = result.status_code, project = %task.project, taskid = %task.taskid, url = %task.url, elapsed = result.time, "{name} fetch complete");
    } else {
        deps.transport.metrics.increment("fetch_error_http", 1, &[]);
        tracing::error!(status = result.status_code, project = %task.project, taskid = %task.taskid, url = %task.url, elapsed = result.time, "{name} fetch failed");
    }
    deps.transport.metrics.record_timer("fetch_time", &[], result.time);

    result
}

/// Records `fetch_error_<kind>`/`fetch_time` for a remote-backend call that failed before it
/// produced a usable [`FetchResult`] (transport error or unparseable body), mirroring the
/// bookkeeping the HTTP transport does for its own failures.
fn remote_error_outcome(deps: &BackendDeps<'_>, orig_url: &str, err: &FetchError, elapsed_secs: f64) -> FetchResult {
    deps.transport
        .metrics
        .increment(&format!("fetch_error_{}", err.kind.metric_suffix()), 1, &[]);
    deps.transport.metrics.record_timer("fetch_time", &[], elapsed_secs);
    FetchResult::from_error(orig_url, err, elapsed_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_fetch_type_flag_is_detected() {
        let (fetch_type, is_legacy) = resolve_fetch_type(Some("phantomjs"));
        assert_eq!(fetch_type, FetchType::Puppeteer);
        assert!(is_legacy);
    }
}
