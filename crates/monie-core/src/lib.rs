//! monie core - an offline exchange-rate worker.
//!
//! The worker sits between the rates app and the network. It keeps every
//! resource the app needs in a versioned cache so the app works offline,
//! refreshes the rates resource on demand or when a push says new rates were
//! published, and relays messages to connected clients.
//!
//! Start with [`worker::Worker`]; [`config::Config`] builds its configuration.

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod notify;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bus::{ClientId, MessageBus};
pub use cache::{CacheStore, GenerationId, PrecacheManifest};
pub use config::Config;
pub use error::{Result, WorkerError};
pub use http::{HttpNetwork, Network, Request, Response};
pub use notify::{Notification, NotificationSink};
pub use worker::{LifecycleEvent, Worker, WorkerConfig};
