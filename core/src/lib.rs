//! The fetcher core: request engine, backend router, pool optimiser, memory governor, robots
//! cache, service shell and RPC bridge.
//!
//! [`context::FetcherContext`] is the seam every caller goes through — the CLI entry point builds
//! one from a resolved configuration, spawns its background loops, and drives it either through
//! [`shell::ServiceShell`]'s queue loop or [`rpc::router`]'s HTTP surface (normally both at once).

pub mod backend;
pub mod context;
pub mod cookies;
pub mod memory;
pub mod pool;
pub mod robots;
pub mod rpc;
pub mod shell;
pub mod transport;

pub use backend::{dispatch, BackendDeps};
pub use context::FetcherContext;
pub use memory::{MemoryGovernor, Reclaimable};
pub use pool::PoolOptimiser;
pub use robots::RobotsCache;
pub use rpc::{router as rpc_router, RpcState};
pub use shell::{ServiceShell, ShellState};
pub use transport::{http_fetch, TransportDeps};
