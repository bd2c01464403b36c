//! Event-sourced state-synchronization core.
//!
//! Remote protocol events and local commands all flow through one
//! dispatcher as [`action::Action`]s; pure per-slice reducers are the only
//! thing that mutates the projected [`state::AppState`], and standing
//! effects react to the re-broadcast actions. A root [`Supervisor`] runs
//! the whole listener set and restarts it on crash.

pub mod account;
pub mod action;
pub mod contact;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod groups;
pub mod message;
pub mod settings;
pub mod slice;
pub mod state;
pub mod supervisor;

pub use action::{Action, Command, Control, Event, ProtocolAction};
pub use dispatch::Handle;
pub use error::{ConfigError, CoreError};
pub use state::AppState;
pub use supervisor::Supervisor;
