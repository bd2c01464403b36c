//! The closed action vocabulary of the engine.
//!
//! Everything that flows through the dispatcher is one of these variants.
//! Commands ask for side effects, events are the only way state changes,
//! protocol actions re-publish decoded service envelopes, and control
//! actions drive the engine lifecycle itself.

use courrier_proto::types::{MessageEnvelope, MetadataEnvelope};

use crate::account::{AccountCommand, AccountEvent};
use crate::contact::{ContactCommand, ContactEvent};
use crate::conversation::{ConversationCommand, ConversationEvent};
use crate::groups::{GroupsCommand, GroupsEvent};
use crate::message::{MessageCommand, MessageEvent};
use crate::settings::SettingsEvent;

#[derive(Debug, Clone)]
pub enum Action {
    Command(Command),
    Event(Event),
    Protocol(ProtocolAction),
    Control(Control),
}

/// Requests for side effects, one aggregate per slice. Commands never touch
/// state directly; their handlers dispatch events.
#[derive(Debug, Clone)]
pub enum Command {
    Groups(GroupsCommand),
    Contact(ContactCommand),
    Conversation(ConversationCommand),
    Message(MessageCommand),
    Account(AccountCommand),
}

/// State mutations. Reduced by the dispatcher, then re-broadcast.
#[derive(Debug, Clone)]
pub enum Event {
    Groups(GroupsEvent),
    Contact(ContactEvent),
    Conversation(ConversationEvent),
    Message(MessageEvent),
    Account(AccountEvent),
    Settings(SettingsEvent),
}

/// Decoded service envelopes re-published on the action bus by the group
/// listener tasks.
#[derive(Debug, Clone)]
pub enum ProtocolAction {
    GroupMetadata(MetadataEnvelope),
    GroupMessage(MessageEnvelope),
}

/// Engine lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// The bootstrap sequence completed; emitted exactly once per engine run.
    AppReady,
    /// Tear down the orchestration set and start over, keeping state.
    Restart,
    /// Tear down, wipe projected and persisted state, start over.
    ClearStore,
    /// Stop the per-group listener tasks without restarting.
    StopClient,
}

impl From<Command> for Action {
    fn from(c: Command) -> Self {
        Action::Command(c)
    }
}

impl From<Event> for Action {
    fn from(e: Event) -> Self {
        Action::Event(e)
    }
}

impl From<ProtocolAction> for Action {
    fn from(p: ProtocolAction) -> Self {
        Action::Protocol(p)
    }
}

impl From<Control> for Action {
    fn from(c: Control) -> Self {
        Action::Control(c)
    }
}

macro_rules! action_from {
    ($ty:ty, $outer:ident :: $variant:ident) => {
        impl From<$ty> for Action {
            fn from(value: $ty) -> Self {
                Action::$outer($outer::$variant(value))
            }
        }
    };
}

action_from!(GroupsCommand, Command::Groups);
action_from!(ContactCommand, Command::Contact);
action_from!(ConversationCommand, Command::Conversation);
action_from!(MessageCommand, Command::Message);
action_from!(AccountCommand, Command::Account);

action_from!(GroupsEvent, Event::Groups);
action_from!(ContactEvent, Event::Contact);
action_from!(ConversationEvent, Event::Conversation);
action_from!(MessageEvent, Event::Message);
action_from!(AccountEvent, Event::Account);
action_from!(SettingsEvent, Event::Settings);
