//! Versioned response cache.
//!
//! This module provides the `CacheStore`, which keeps one generation of
//! response snapshots per deployment, and the `PrecacheManifest` listing the
//! resources every generation must hold.
//!
//! Generations are written either completely (install) or one entry at a time
//! (refresh); a partially fetched manifest is never visible.

pub mod manifest;
pub mod store;

pub use manifest::PrecacheManifest;
pub use store::{CacheHandle, CacheStore, CachedResponse, GenerationId, KeyLockGuard};
