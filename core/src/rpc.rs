//! RPC bridge: a binary-packed transport over HTTP POST, fronted by `axum`.
//!
//! Each call is unpacked with `rmp-serde`, submitted to the async core, and the caller blocks on
//! an `oneshot` reply channel until the result arrives — the same blocking-bridge shape as the
//! doorway worker pool's `request()`/`response_tx` pair, adapted from a semaphore-gated mpsc
//! queue to axum's own per-connection concurrency.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{http::StatusCode, Json, Router};
use fetchcore_types::{CounterKind, CounterWindow, ErrorKind, RpcFetchRequest, RpcFetchResponse, Task};
use tokio::sync::oneshot;

use crate::backend::{self, BackendDeps};
use crate::context::FetcherContext;
use crate::robots::RobotsCache;
use crate::transport::TransportDeps;

/// Shared state behind the axum router; cheap to clone (everything is `Arc`-backed).
#[derive(Clone)]
pub struct RpcState {
    ctx: Arc<FetcherContext>,
    in_flight: Arc<AtomicI64>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl RpcState {
    #[must_use]
    pub fn new(ctx: Arc<FetcherContext>, shutdown: Arc<tokio::sync::Notify>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(AtomicI64::new(0)),
            shutdown,
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

#[must_use]
pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/fetch", post(handle_fetch))
        .route("/size", axum::routing::get(handle_size))
        .route("/counter/{window}/{kind}", axum::routing::get(handle_counter))
        .route("/quit", post(handle_quit))
        .with_state(state)
}

async fn handle_fetch(State(state): State<RpcState>, body: Bytes) -> impl IntoResponse {
    let request: RpcFetchRequest = match rmp_serde::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("malformed request: {e}")).into_response(),
    };

    state.in_flight.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    let ctx = Arc::clone(&state.ctx);
    tokio::spawn(async move {
        let result = run_fetch(&request.task, &ctx).await;
        let _ = tx.send(result);
    });

    let result = match rx.await {
        Ok(result) => result,
        Err(_) => {
            state.in_flight.fetch_sub(1, Ordering::Relaxed);
            return (StatusCode::INTERNAL_SERVER_ERROR, "fetch task dropped before completion").into_response();
        }
    };
    state.in_flight.fetch_sub(1, Ordering::Relaxed);

    let response = RpcFetchResponse { result };
    match rmp_serde::to_vec_named(&response) {
        Ok(packed) => (StatusCode::OK, packed).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to pack response: {e}")).into_response(),
    }
}

async fn run_fetch(task: &Task, ctx: &FetcherContext) -> fetchcore_types::FetchResult {
    let robots: &RobotsCache = &ctx.robots;
    let deps = BackendDeps {
        transport: TransportDeps {
            pool: &ctx.pool,
            robots,
            client: &ctx.client,
            metrics: Arc::clone(&ctx.metrics),
            default_user_agent: &ctx.config.transport.default_user_agent,
            default_proxy: ctx.config.transport.default_proxy.as_ref().map(url::Url::as_str),
            default_verify_tls: ctx.config.transport.verify_tls,
        },
        robots,
        puppeteer: &ctx.config.backends.puppeteer,
        playwright: &ctx.config.backends.playwright,
        py_playwright: &ctx.config.backends.py_playwright,
        splash: &ctx.config.backends.splash,
        splash_lua_source: &ctx.config.backends.splash_lua_source,
    };
    backend::dispatch(task, task.track.as_ref(), &deps).await
}

async fn handle_size(State(state): State<RpcState>) -> impl IntoResponse {
    Json(serde_json::json!({ "size": state.in_flight() }))
}

fn window_duration(window: CounterWindow) -> Duration {
    match window {
        CounterWindow::FiveMinutes => Duration::from_secs(5 * 60),
        CounterWindow::OneHour => Duration::from_secs(60 * 60),
    }
}

async fn handle_counter(
    State(state): State<RpcState>,
    Path((window, kind)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(window) = CounterWindow::parse(&window) else {
        return (StatusCode::BAD_REQUEST, "unknown window").into_response();
    };
    let Some(kind) = CounterKind::parse(&kind) else {
        return (StatusCode::BAD_REQUEST, "unknown counter type").into_response();
    };
    let window = window_duration(window);

    let metrics = &state.ctx.metrics;
    let value = match kind {
        CounterKind::All => {
            let success = metrics.windowed_sum("fetch_success", &[], window);
            let errors: f64 = ErrorKind::ALL_SUFFIXES
                .iter()
                .map(|suffix| metrics.windowed_sum(&format!("fetch_error_{suffix}"), &[], window))
                .sum();
            (success + errors) as i64
        }
        CounterKind::Success => metrics.windowed_sum("fetch_success", &[], window) as i64,
        CounterKind::Failed => ErrorKind::ALL_SUFFIXES
            .iter()
            .map(|suffix| metrics.windowed_sum(&format!("fetch_error_{suffix}"), &[], window))
            .sum::<f64>() as i64,
        CounterKind::Pending => state.in_flight(),
        CounterKind::Retry => 0,
        CounterKind::Speed | CounterKind::Time => {
            let avg = metrics.windowed_avg("fetch_time", &[], window);
            return Json(serde_json::json!({ "avg": avg })).into_response();
        }
    };
    Json(serde_json::json!({ "value": value })).into_response()
}

async fn handle_quit(State(state): State<RpcState>) -> impl IntoResponse {
    tracing::info!("RPC _quit received; in-flight={}", state.in_flight());
    state.shutdown.notify_one();
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_and_kind_parsing_rejects_unknown_values() {
        assert!(CounterWindow::parse("5m").is_some());
        assert!(CounterWindow::parse("3d").is_none());
        assert!(CounterKind::parse("speed").is_some());
        assert!(CounterKind::parse("bogus").is_none());
    }
}
