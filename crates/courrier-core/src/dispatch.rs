//! Dispatcher task and the [`Handle`] everything else talks through.
//!
//! The dispatcher is the single owner of [`AppState`]. Events are reduced
//! there, written through to the store, and only then re-broadcast, so a
//! listener woken by an action always observes the state that action
//! produced.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use courrier_store::{Namespace, StateStore};

use crate::action::{Action, Control, Event};
use crate::error::CoreError;
use crate::state::AppState;
use crate::{account, contact, conversation, groups, message, settings};

const COMMAND_BUFFER: usize = 256;
const BROADCAST_CAPACITY: usize = 1024;

enum StoreMsg {
    Dispatch(Action),
    Select(Box<dyn FnOnce(&AppState) + Send>),
}

/// Cheap-to-clone entry point into the dispatcher.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<StoreMsg>,
    broadcast: broadcast::Sender<Action>,
}

impl Handle {
    /// Queue an action for dispatch.
    pub async fn dispatch(&self, action: impl Into<Action>) -> Result<(), CoreError> {
        self.tx
            .send(StoreMsg::Dispatch(action.into()))
            .await
            .map_err(|_| CoreError::DispatcherGone)
    }

    /// Run a pure query against the current state.
    pub async fn select<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&AppState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StoreMsg::Select(Box::new(move |state| {
                let _ = reply_tx.send(f(state));
            })))
            .await
            .map_err(|_| CoreError::DispatcherGone)?;
        reply_rx.await.map_err(|_| CoreError::DispatcherGone)
    }

    /// Observe every action dispatched from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Action> {
        self.broadcast.subscribe()
    }

    /// Await the first action matching `filter`, observing from now on.
    ///
    /// When the awaited action may be triggered by something the caller does
    /// first, subscribe before triggering and use [`Handle::take_from`], or
    /// the action can slip past between the trigger and the wait.
    pub async fn take<F>(&self, filter: F) -> Result<Action, CoreError>
    where
        F: Fn(&Action) -> bool,
    {
        self.take_from(self.subscribe(), filter).await
    }

    /// Await the first matching action on an already-open subscription.
    pub async fn take_from<F>(
        &self,
        mut rx: broadcast::Receiver<Action>,
        filter: F,
    ) -> Result<Action, CoreError>
    where
        F: Fn(&Action) -> bool,
    {
        loop {
            match rx.recv().await {
                Ok(action) if filter(&action) => return Ok(action),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(CoreError::Lagged(skipped))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CoreError::DispatcherGone),
            }
        }
    }
}

/// Spawn the dispatcher task over an initial state.
///
/// The task lives as long as at least one `Handle` clone does; it is not
/// part of the supervisor's restart set, so projected state survives
/// orchestration restarts.
pub fn spawn_dispatcher(initial: AppState, store: Arc<dyn StateStore>) -> Handle {
    let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);
    let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    let handle = Handle {
        tx,
        broadcast: broadcast_tx.clone(),
    };

    tokio::spawn(async move {
        let mut state = initial;
        while let Some(msg) = rx.recv().await {
            match msg {
                StoreMsg::Select(query) => query(&state),
                StoreMsg::Dispatch(action) => {
                    match &action {
                        Action::Event(event) => {
                            reduce(&mut state, event);
                            persist(store.as_ref(), &state, namespace_of(event));
                        }
                        Action::Control(Control::ClearStore) => {
                            state = AppState::default();
                            if let Err(error) = store.clear() {
                                warn!(%error, "failed to clear persisted state");
                            }
                        }
                        _ => {}
                    }
                    // A send error only means nobody is listening right now.
                    let _ = broadcast_tx.send(action);
                }
            }
        }
    });

    handle
}

fn reduce(state: &mut AppState, event: &Event) {
    match event {
        Event::Groups(e) => groups::reduce(&mut state.groups, e),
        Event::Contact(e) => contact::reduce(&mut state.messenger.contact, e),
        Event::Conversation(e) => conversation::reduce(&mut state.messenger.conversation, e),
        Event::Message(e) => message::reduce(&mut state.messenger.message, e),
        Event::Account(e) => account::reduce(state, e),
        Event::Settings(e) => settings::reduce(&mut state.settings, e),
    }
}

fn namespace_of(event: &Event) -> Namespace {
    match event {
        Event::Groups(_) => Namespace::Groups,
        Event::Settings(_) => Namespace::Settings,
        _ => Namespace::Messenger,
    }
}

fn persist(store: &dyn StateStore, state: &AppState, namespace: Namespace) {
    let blob = match namespace {
        Namespace::Messenger => serde_json::to_vec(&state.messenger),
        Namespace::Settings => serde_json::to_vec(&state.settings),
        Namespace::Groups => serde_json::to_vec(&state.groups),
    };
    match blob {
        Ok(blob) => {
            if let Err(error) = store.save(namespace, &blob) {
                warn!(%namespace, %error, "state write-through failed");
            }
        }
        Err(error) => warn!(%namespace, %error, "state serialization failed"),
    }
}

/// Load whatever the store holds, falling back to defaults per namespace.
pub fn restore(store: &dyn StateStore) -> AppState {
    let mut state = AppState::default();
    for namespace in Namespace::ALL {
        let blob = match store.load(namespace) {
            Ok(Some(blob)) => blob,
            Ok(None) => continue,
            Err(error) => {
                warn!(%namespace, %error, "failed to load persisted namespace");
                continue;
            }
        };
        let result = match namespace {
            Namespace::Messenger => {
                serde_json::from_slice(&blob).map(|m| state.messenger = m)
            }
            Namespace::Settings => serde_json::from_slice(&blob).map(|s| state.settings = s),
            Namespace::Groups => serde_json::from_slice(&blob).map(|g| state.groups = g),
        };
        if let Err(error) = result {
            warn!(%namespace, %error, "discarding unreadable persisted namespace");
        }
    }
    state
}
