//! Root supervisor: runs every slice's orchestrator plus the bootstrap
//! sequence as one task set, and restarts the whole set on crash or on an
//! explicit restart signal.
//!
//! The dispatcher is started once and lives outside the restart loop, so
//! projected state survives restarts; only the listeners and their forked
//! tasks are torn down and rebuilt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courrier_proto::{BridgeConfig, NativeBridge, ProtocolService};
use courrier_store::StateStore;

use crate::account::{self, AccountEvent};
use crate::action::{Action, Control, Event};
use crate::dispatch::{self, Handle};
use crate::error::{ConfigError, CoreError};
use crate::slice::{Ctx, Slice};
use crate::state::ClientInfo;
use crate::{contact, conversation, groups, message};

const CRASH_BACKOFF: Duration = Duration::from_millis(1000);
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

enum RunEnd {
    Crashed,
    Restart,
}

pub struct Supervisor {
    handle: Handle,
    protocol: Arc<dyn ProtocolService>,
    bridge: Arc<dyn NativeBridge>,
}

impl Supervisor {
    /// Restore persisted state, start the dispatcher and wire the engine.
    pub fn new(
        protocol: Arc<dyn ProtocolService>,
        bridge: Arc<dyn NativeBridge>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let state = dispatch::restore(store.as_ref());
        let handle = dispatch::spawn_dispatcher(state, store);
        Self {
            handle,
            protocol,
            bridge,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    fn build_slices() -> Result<Vec<Slice>, ConfigError> {
        let slices = vec![
            groups::slice()?,
            contact::slice()?,
            conversation::slice()?,
            message::slice()?,
            account::slice()?,
        ];
        let mut seen = HashSet::new();
        for slice in &slices {
            if !seen.insert(slice.name) {
                return Err(ConfigError::DuplicateSlice(slice.name.to_string()));
            }
        }
        Ok(slices)
    }

    /// Run forever. Only construction errors and a dead dispatcher end the
    /// loop; everything else restarts it after a backoff.
    pub async fn run(self) -> Result<(), CoreError> {
        loop {
            match self.run_once().await? {
                RunEnd::Crashed => {
                    warn!("orchestration crashed, retrying in 1s");
                    tokio::time::sleep(CRASH_BACKOFF).await;
                }
                RunEnd::Restart => {
                    info!("restarting orchestration");
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        }
    }

    async fn run_once(&self) -> Result<RunEnd, CoreError> {
        let slices = Self::build_slices()?;
        let cancel = CancellationToken::new();
        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel();
        let ctx = Ctx::new(
            self.handle.clone(),
            self.protocol.clone(),
            self.bridge.clone(),
            cancel.clone(),
            crash_tx,
        );

        let mut control_rx = self.handle.subscribe();
        let mut set: JoinSet<Result<(), CoreError>> = JoinSet::new();
        for slice in slices {
            set.spawn(slice.orchestrate(ctx.clone()));
        }
        set.spawn(bootstrap(ctx.clone()));

        let end = loop {
            tokio::select! {
                Some(error) = crash_rx.recv() => {
                    error!(%error, "forked task crashed");
                    break RunEnd::Crashed;
                }
                done = set.join_next() => match done {
                    // Bootstrap finishing is the normal case; orchestrators
                    // only return cleanly on cancellation.
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(error))) => {
                        error!(%error, "orchestration task failed");
                        break RunEnd::Crashed;
                    }
                    Some(Err(join_error)) => {
                        error!(error = %join_error, "orchestration task aborted");
                        break RunEnd::Crashed;
                    }
                    None => break RunEnd::Crashed,
                },
                recv = control_rx.recv() => match recv {
                    Ok(Action::Control(Control::Restart | Control::ClearStore)) => {
                        break RunEnd::Restart;
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        break RunEnd::Crashed;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(CoreError::DispatcherGone);
                    }
                }
            }
        };

        cancel.cancel();
        set.shutdown().await;
        Ok(end)
    }
}

/// Bring the engine up: wait for an account, start the native service,
/// record the client identity, open the account and announce readiness.
async fn bootstrap(ctx: Ctx) -> Result<(), CoreError> {
    // Subscribe before the existence check so a creation racing with the
    // restart is not missed.
    let rx = ctx.handle.subscribe();
    let mut account = ctx
        .handle
        .select(|state| state.messenger.account.clone())
        .await?;
    if account.is_none() {
        ctx.handle
            .take_from(rx, |action| {
                matches!(
                    action,
                    Action::Event(Event::Account(AccountEvent::Created { .. }))
                )
            })
            .await?;
        account = ctx
            .handle
            .select(|state| state.messenger.account.clone())
            .await?;
    }
    let account = account
        .ok_or_else(|| CoreError::Invariant("account missing after creation".to_string()))?;

    ctx.bridge
        .start(BridgeConfig {
            name: account.name.clone(),
        })
        .await?;

    let configuration = ctx.protocol.instance_get_configuration().await?;
    ctx.handle
        .dispatch(AccountEvent::ClientStarted(ClientInfo {
            account_pk: configuration.account_pk,
            account_group_pk: configuration.account_group_pk,
            device_pk: configuration.device_pk,
            contact_request_rdv_seed: None,
        }))
        .await?;

    account::tx_open(&ctx).await?;
    ctx.handle.dispatch(Control::AppReady).await?;
    info!(account = %account.name, "app ready");
    Ok(())
}
