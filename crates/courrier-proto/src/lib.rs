//! Facade over the remote protocol service and the native lifecycle bridge.
//!
//! The projection core never touches wire encoding: it talks to the service
//! through [`ProtocolService`] (unary calls returning typed replies,
//! subscriptions returning lazy cancelable event streams) and to the daemon
//! lifecycle through [`NativeBridge`]. Both are trait objects so tests can
//! substitute the in-memory [`testing`] implementations.

pub mod bridge;
pub mod error;
pub mod service;
pub mod testing;
pub mod types;

pub use bridge::{BridgeConfig, BridgeError, NativeBridge};
pub use error::RemoteError;
pub use service::{EventStream, ProtocolService};
