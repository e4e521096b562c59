//! Core domain types for the fetcher core.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod content;
mod error;
mod headers;
mod id;
mod result;
mod rpc;
mod task;

pub use content::Content;
pub use error::{ErrorDetails, ErrorKind, FetchError};
pub use headers::Headers;
pub use id::TaskId;
pub use result::{FetchResult, TRANSPORT_FAILURE_STATUS};
pub use rpc::{CounterKind, CounterWindow, RpcFetchRequest, RpcFetchResponse};
pub use task::{resolve_fetch_type, FetchConfig, FetchType, Task, Track, TrackFetch};
