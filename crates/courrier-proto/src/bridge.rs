//! Native lifecycle bridge for the protocol daemon.

use async_trait::async_trait;
use thiserror::Error;

/// Options passed when starting the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Display name of the local account, forwarded to the daemon.
    pub name: String,
}

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("Failed to start protocol daemon: {0}")]
    Start(String),

    #[error("Failed to stop protocol daemon: {0}")]
    Stop(String),

    #[error("Failed to clear protocol storage: {0}")]
    ClearStorage(String),
}

/// Black-box control over the daemon process. Callers must await each call
/// before relying on the state it establishes (e.g. `clear_storage` before
/// finishing an account deletion).
#[async_trait]
pub trait NativeBridge: Send + Sync {
    async fn start(&self, config: BridgeConfig) -> Result<(), BridgeError>;
    async fn stop(&self) -> Result<(), BridgeError>;
    async fn clear_storage(&self) -> Result<(), BridgeError>;
}
