use thiserror::Error;

use courrier_proto::{BridgeError, RemoteError};
use courrier_store::StoreError;

/// Slice/engine construction errors. Fatal: raised before any task starts,
/// never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid slice name")]
    InvalidSliceName,

    #[error("Duplicate slice name: {0}")]
    DuplicateSlice(String),

    #[error("Invalid effect in slice '{slice}': {reason}")]
    InvalidEffect {
        slice: &'static str,
        reason: String,
    },

    #[error("Duplicate effect name in slice '{slice}': {effect}")]
    DuplicateEffect {
        slice: &'static str,
        effect: &'static str,
    },
}

/// Errors crossing task boundaries inside the core.
///
/// Remote-call failures are usually absorbed close to where they happen
/// (stored on a draft or status field); whatever reaches the supervisor as a
/// `CoreError` is treated as a crash of the whole orchestration set.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("State serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Dispatcher is gone")]
    DispatcherGone,

    #[error("Action bus lagged by {0} actions")]
    Lagged(u64),

    #[error("Tried to open the account while it's undefined")]
    AccountMissing,

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Task failure: {0}")]
    Task(String),
}
