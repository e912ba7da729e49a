//! Data models shared between the worker and its foreground clients.
//!
//! - `RatesDocument`: the opaque body of the dynamic rates resource
//! - `PushPayload`: decoded push deliveries
//! - `PushSubscription`: the body posted to the push-registration endpoint
//! - `ClientMessage`, `WorkerMessage`: the two directions of the message protocol

pub mod message;
pub mod push;

pub use message::{ClientMessage, WorkerMessage};
pub use push::{PushPayload, PushSubscription, RatesDocument};
