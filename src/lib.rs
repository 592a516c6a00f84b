//! busbridge - client for a remote event bus bridge.
//!
//! Connects to a bus bridge over TCP and exchanges length-prefixed JSON
//! records with it: point-to-point sends, publishes, address registration,
//! and inbound delivery.
//!
//! # Architecture
//!
//! - **BridgeClient** - one connection; typed outbound records and a
//!   blocking `receive()`
//! - **Dispatcher** - owns the receive side and fans inbound records out to
//!   local per-address subscriptions
//! - **BridgeConfig** - address, frame limit, queue capacity, keepalive
//!
//! # Modules
//!
//! - [`bridge`] - Frame codec, record model, client connection
//! - [`dispatcher`] - Subscription fan-out and lifecycle
//! - [`config`] - Configuration loading

pub mod bridge;
pub mod config;
pub mod dispatcher;

pub use bridge::{BridgeClient, BridgeError, Failure, Message, MessageKind};
pub use config::BridgeConfig;
pub use dispatcher::{Dispatcher, DispatcherState, Subscription};
