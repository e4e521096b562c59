//! Service shell (component G): the queue-mode driving loop around the fetcher context.
//!
//! State machine is `Idle -> Running -> Draining -> Stopped`. While `Running` the shell ticks on
//! a fixed cadence (`shell.queue_tick`), pulling tasks off an input queue, spawning one fetch per
//! task up to the pool optimiser's current size, and pushing completed results onto a bounded
//! output queue. A second, slower tick sweeps expired robots.txt cache entries. `Draining` stops
//! accepting new input and waits for in-flight fetches to finish (or `shell.drain_deadline` to
//! elapse, whichever comes first) before settling into `Stopped`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fetchcore_types::{FetchResult, Task};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::backend::{self, BackendDeps};
use crate::context::FetcherContext;
use crate::transport::TransportDeps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Idle,
    Running,
    Draining,
    Stopped,
}

pub struct ServiceShell {
    ctx: Arc<FetcherContext>,
    input: mpsc::Receiver<Task>,
    output: mpsc::Sender<FetchResult>,
    in_flight: Arc<AtomicU32>,
    state: ShellState,
}

impl ServiceShell {
    #[must_use]
    pub fn new(ctx: Arc<FetcherContext>, input: mpsc::Receiver<Task>) -> (Self, mpsc::Receiver<FetchResult>) {
        let (output, output_rx) = mpsc::channel(ctx.config.shell.output_queue_capacity);
        let shell = Self {
            ctx,
            input,
            output,
            in_flight: Arc::new(AtomicU32::new(0)),
            state: ShellState::Idle,
        };
        (shell, output_rx)
    }

    #[must_use]
    pub fn state(&self) -> ShellState {
        self.state
    }

    /// Run the queue-mode loop until the input queue closes, then drain in-flight work and settle
    /// into `Stopped`. Returns once draining completes (or the deadline elapses).
    pub async fn run(&mut self) {
        self.state = ShellState::Running;
        tracing::info!("service shell running");

        let mut queue_tick = interval(self.ctx.config.shell.queue_tick);
        let mut robots_tick = interval(self.ctx.config.shell.robots_sweep_interval);

        loop {
            tokio::select! {
                _ = queue_tick.tick() => {
                    if !self.drain_input_once().await {
                        break;
                    }
                }
                _ = robots_tick.tick() => {
                    let swept = self.ctx.robots.sweep();
                    if swept > 0 {
                        tracing::debug!(swept, "robots cache sweep");
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Pull tasks off the input queue while the pool has spare capacity and the output queue
    /// isn't saturated, spawning one fetch per task. Returns `false` once the input channel has
    /// closed (distinct from a momentarily empty queue, which returns `true` and simply ticks
    /// again next interval).
    async fn drain_input_once(&mut self) -> bool {
        self.ctx.pool.set_queue_size(self.input.len() as u32);

        loop {
            if self.in_flight.load(Ordering::Acquire) >= self.ctx.pool.current_pool_size() {
                return true;
            }
            if self.output.capacity() == 0 {
                return true;
            }

            let task = match self.input.try_recv() {
                Ok(task) => task,
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            };

            self.spawn_fetch(task);
        }
    }

    fn spawn_fetch(&self, task: Task) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let ctx = Arc::clone(&self.ctx);
        let output = self.output.clone();
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            let result = run_fetch(&task, &ctx).await;
            let still_active = in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
            ctx.memory.check_memory_if_idle(still_active, ctx.pool.queue_size());
            if output.send(result).await.is_err() {
                tracing::warn!(taskid = %task.taskid, "output queue closed before result could be delivered");
            }
        });
    }

    /// Stop admitting new tasks and wait for in-flight fetches to complete, up to
    /// `shell.drain_deadline`.
    async fn drain(&mut self) {
        self.state = ShellState::Draining;
        let deadline = Instant::now() + self.ctx.config.shell.drain_deadline;
        tracing::info!(in_flight = self.in_flight.load(Ordering::Acquire), "draining");

        while self.in_flight.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let remaining = self.in_flight.load(Ordering::Acquire);
        if remaining > 0 {
            tracing::warn!(remaining, "drain deadline elapsed with fetches still in flight");
        }

        self.state = ShellState::Stopped;
        tracing::info!("service shell stopped");
    }
}

async fn run_fetch(task: &Task, ctx: &FetcherContext) -> FetchResult {
    let deps = BackendDeps {
        transport: TransportDeps {
            pool: &ctx.pool,
            robots: &ctx.robots,
            client: &ctx.client,
            metrics: Arc::clone(&ctx.metrics),
            default_user_agent: &ctx.config.transport.default_user_agent,
            default_proxy: ctx.config.transport.default_proxy.as_ref().map(url::Url::as_str),
            default_verify_tls: ctx.config.transport.verify_tls,
        },
        robots: &ctx.robots,
        puppeteer: &ctx.config.backends.puppeteer,
        playwright: &ctx.config.backends.playwright,
        py_playwright: &ctx.config.backends.py_playwright,
        splash: &ctx.config.backends.splash,
        splash_lua_source: &ctx.config.backends.splash_lua_source,
    };
    backend::dispatch(task, task.track.as_ref(), &deps).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchcore_config::FetcherConfig;

    fn test_context() -> Arc<FetcherContext> {
        let resolved = FetcherConfig::default().resolve().unwrap();
        Arc::new(FetcherContext::new(resolved).unwrap())
    }

    #[tokio::test]
    async fn empty_queue_keeps_running_state() {
        let ctx = test_context();
        let (input_tx, input_rx) = mpsc::channel(8);
        let (mut shell, _output_rx) = ServiceShell::new(ctx, input_rx);
        shell.state = ShellState::Running;
        assert!(shell.drain_input_once().await);
        drop(input_tx);
    }

    #[tokio::test]
    async fn closed_input_queue_is_distinguished_from_empty() {
        let ctx = test_context();
        let (input_tx, input_rx) = mpsc::channel(8);
        let (mut shell, _output_rx) = ServiceShell::new(ctx, input_rx);
        drop(input_tx);
        assert!(!shell.drain_input_once().await);
    }

    #[tokio::test]
    async fn drain_settles_to_stopped_once_in_flight_reaches_zero() {
        let ctx = test_context();
        let (_input_tx, input_rx) = mpsc::channel(8);
        let (mut shell, _output_rx) = ServiceShell::new(ctx, input_rx);
        shell.drain().await;
        assert_eq!(shell.state(), ShellState::Stopped);
    }
}
