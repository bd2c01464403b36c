//! Slice framework: declared effects, validated construction, and the
//! orchestration loop that turns declarations into standing listener tasks.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use courrier_proto::{NativeBridge, ProtocolService};

use crate::action::Action;
use crate::dispatch::Handle;
use crate::error::{ConfigError, CoreError};

type EffectFuture = Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send>>;
type EffectFn = Arc<dyn Fn(Ctx, Action) -> EffectFuture + Send + Sync>;

/// A standing listener: for every dispatched action matching `filter`, the
/// orchestrator runs `handler` as its own task. Handlers are sequential per
/// dispatch but concurrent across dispatches.
pub struct EffectDef {
    pub name: &'static str,
    pub filter: fn(&Action) -> bool,
    handler: EffectFn,
}

impl EffectDef {
    pub fn new<F, Fut>(name: &'static str, filter: fn(&Action) -> bool, handler: F) -> Self
    where
        F: Fn(Ctx, Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        Self {
            name,
            filter,
            handler: Arc::new(move |ctx, action| Box::pin(handler(ctx, action))),
        }
    }
}

/// Declarative description of a slice, validated by [`Slice::build`].
pub struct SliceDef {
    pub name: &'static str,
    pub effects: Vec<EffectDef>,
}

/// A validated slice, ready to orchestrate.
pub struct Slice {
    pub name: &'static str,
    effects: Vec<EffectDef>,
}

impl Slice {
    /// Validate a definition. Fails fast, before any task starts.
    pub fn build(def: SliceDef) -> Result<Self, ConfigError> {
        if def.name.is_empty() {
            return Err(ConfigError::InvalidSliceName);
        }
        let mut seen = HashSet::new();
        for effect in &def.effects {
            if effect.name.is_empty() {
                return Err(ConfigError::InvalidEffect {
                    slice: def.name,
                    reason: "empty effect name".into(),
                });
            }
            if !seen.insert(effect.name) {
                return Err(ConfigError::DuplicateEffect {
                    slice: def.name,
                    effect: effect.name,
                });
            }
        }
        Ok(Self {
            name: def.name,
            effects: def.effects,
        })
    }

    /// Run the slice's standing listeners until cancellation.
    ///
    /// A handler error, a lagged action bus or a closed dispatcher all end
    /// the loop with an error; the supervisor treats any of them as a crash
    /// of the whole orchestration set.
    pub async fn orchestrate(self, ctx: Ctx) -> Result<(), CoreError> {
        let mut rx = ctx.handle.subscribe();
        let mut handlers: JoinSet<(&'static str, Result<(), CoreError>)> = JoinSet::new();
        debug!(slice = self.name, effects = self.effects.len(), "slice orchestration started");

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    handlers.shutdown().await;
                    debug!(slice = self.name, "slice orchestration stopped");
                    return Ok(());
                }
                recv = rx.recv() => {
                    let action = match recv {
                        Ok(action) => action,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            return Err(CoreError::Lagged(skipped));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            return Err(CoreError::DispatcherGone);
                        }
                    };
                    for effect in &self.effects {
                        if (effect.filter)(&action) {
                            let name = effect.name;
                            let fut = (effect.handler)(ctx.clone(), action.clone());
                            handlers.spawn(async move { (name, fut.await) });
                        }
                    }
                }
                Some(done) = handlers.join_next() => {
                    match done {
                        Ok((_, Ok(()))) => {}
                        Ok((name, Err(error))) => {
                            error!(slice = self.name, effect = name, %error, "effect handler failed");
                            return Err(error);
                        }
                        Err(join_error) => return Err(CoreError::Task(join_error.to_string())),
                    }
                }
            }
        }
    }
}

/// Capabilities handed to every effect handler.
#[derive(Clone)]
pub struct Ctx {
    pub handle: Handle,
    pub protocol: Arc<dyn ProtocolService>,
    pub bridge: Arc<dyn NativeBridge>,
    pub cancel: CancellationToken,
    crash_tx: mpsc::UnboundedSender<CoreError>,
}

impl Ctx {
    pub fn new(
        handle: Handle,
        protocol: Arc<dyn ProtocolService>,
        bridge: Arc<dyn NativeBridge>,
        cancel: CancellationToken,
        crash_tx: mpsc::UnboundedSender<CoreError>,
    ) -> Self {
        Self {
            handle,
            protocol,
            bridge,
            cancel,
            crash_tx,
        }
    }

    /// A context whose cancellation is scoped under this one.
    pub fn child(&self) -> Ctx {
        let mut ctx = self.clone();
        ctx.cancel = self.cancel.child_token();
        ctx
    }

    /// Spawn a long-lived task under a child token. Errors are reported to
    /// the supervisor's crash channel; cancellation is clean.
    pub fn fork<F, Fut>(&self, name: &'static str, f: F) -> TaskHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let ctx = self.child();
        let cancel = ctx.cancel.clone();
        let crash_tx = self.crash_tx.clone();
        let fut = f(ctx);
        let handle = tokio::spawn(async move {
            if let Err(error) = fut.await {
                error!(task = name, %error, "forked task failed");
                let _ = crash_tx.send(error);
            }
        });
        TaskHandle { cancel, handle }
    }
}

/// Handle on a forked task: cancel it cooperatively, or await it.
pub struct TaskHandle {
    cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_effect(name: &'static str) -> EffectDef {
        EffectDef::new(name, |_| false, |_, _| async { Ok::<(), CoreError>(()) })
    }

    #[test]
    fn build_rejects_empty_slice_name() {
        let def = SliceDef {
            name: "",
            effects: vec![],
        };
        assert!(matches!(
            Slice::build(def),
            Err(ConfigError::InvalidSliceName)
        ));
    }

    #[test]
    fn build_rejects_duplicate_effect_names() {
        let def = SliceDef {
            name: "demo",
            effects: vec![noop_effect("a"), noop_effect("a")],
        };
        assert!(matches!(
            Slice::build(def),
            Err(ConfigError::DuplicateEffect {
                slice: "demo",
                effect: "a"
            })
        ));
    }

    #[test]
    fn build_rejects_empty_effect_name() {
        let def = SliceDef {
            name: "demo",
            effects: vec![noop_effect("")],
        };
        assert!(matches!(
            Slice::build(def),
            Err(ConfigError::InvalidEffect { slice: "demo", .. })
        ));
    }
}
