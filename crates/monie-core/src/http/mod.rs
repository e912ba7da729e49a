//! Request/response snapshots and the network transport.
//!
//! `Request` is what the worker intercepts, `Response` is what it stores and
//! serves, and `CacheKey` is the canonical identity tying the two together.
//! `HttpNetwork` performs real fetches through `reqwest`.

pub mod network;
pub mod request;

pub use network::{HttpNetwork, Network};
pub use request::{CacheKey, Request, Response};
