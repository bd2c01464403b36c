//! Account slice: the local account aggregate and the engine-facing
//! lifecycle commands (open, create, delete, deep links).

use tracing::warn;

use courrier_proto::types::{ContactMetadata, ContactRef, ContactRequestSendRequest};
use courrier_shared::deeplink::DeepLink;
use courrier_shared::types::PublicKey;

use crate::action::{Action, Command, Control, Event};
use crate::contact::{self};
use crate::conversation::{self};
use crate::error::{ConfigError, CoreError};
use crate::groups::{GroupsCommand, GroupsEvent, SubscribeOptions};
use crate::settings::SettingsEvent;
use crate::slice::{Ctx, EffectDef, Slice, SliceDef};
use crate::state::{Account, AppState, ClientInfo, DeepLinkKind, DeepLinkStatus, NodeConfig};

#[derive(Debug, Clone)]
pub enum AccountCommand {
    /// Bring the engine's listeners up for the existing account. Fails hard
    /// when no account exists.
    Open,
    Create {
        name: String,
        node_config: NodeConfig,
    },
    Delete,
    Onboard,
    SendContactRequest {
        contact_name: String,
        contact_public_key: PublicKey,
        contact_rdv_seed: String,
    },
    HandleDeepLink {
        link: String,
    },
}

#[derive(Debug, Clone)]
pub enum AccountEvent {
    Created { name: String },
    Deleted,
    Onboarded,
    Unboarded,
    DeepLinkDone { link: String, kind: DeepLinkKind },
    DeepLinkError { link: String, error: String },
    /// The protocol instance is up; carries its identity.
    ClientStarted(ClientInfo),
    RdvSeedUpdated { seed: String },
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

pub(crate) fn reduce(state: &mut AppState, event: &AccountEvent) {
    match event {
        AccountEvent::Created { name } => {
            if state.messenger.account.is_none() {
                state.messenger.account = Some(Account {
                    name: name.clone(),
                    onboarded: false,
                    deep_link_status: None,
                });
            }
        }
        AccountEvent::Deleted => state.messenger.account = None,
        AccountEvent::Onboarded => {
            if let Some(account) = state.messenger.account.as_mut() {
                account.onboarded = true;
            }
        }
        AccountEvent::Unboarded => {
            if let Some(account) = state.messenger.account.as_mut() {
                account.onboarded = false;
            }
        }
        AccountEvent::DeepLinkDone { link, kind } => {
            if let Some(account) = state.messenger.account.as_mut() {
                account.deep_link_status = Some(DeepLinkStatus::Done {
                    link: link.clone(),
                    kind: *kind,
                });
            }
        }
        AccountEvent::DeepLinkError { link, error } => {
            if let Some(account) = state.messenger.account.as_mut() {
                account.deep_link_status = Some(DeepLinkStatus::Failed {
                    link: link.clone(),
                    error: error.clone(),
                });
            }
        }
        AccountEvent::ClientStarted(client) => state.client = Some(client.clone()),
        AccountEvent::RdvSeedUpdated { seed } => {
            if let Some(client) = state.client.as_mut() {
                client.contact_request_rdv_seed = Some(seed.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub mod queries {
    use super::*;

    pub fn get(state: &AppState) -> Option<&Account> {
        state.messenger.account.as_ref()
    }

    pub fn request_rdv_seed(state: &AppState) -> Option<&str> {
        state
            .client
            .as_ref()
            .and_then(|c| c.contact_request_rdv_seed.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Open the running account: init conversations, bring group streams up,
/// subscribe the account group's metadata, announce the shareable identity
/// and fetch the contact-request rendezvous reference.
pub(crate) async fn tx_open(ctx: &Ctx) -> Result<(), CoreError> {
    let Some(account) = ctx
        .handle
        .select(|state| state.messenger.account.clone())
        .await?
    else {
        return Err(CoreError::AccountMissing);
    };

    conversation::tx_open(ctx).await?;

    let rx = ctx.handle.subscribe();
    ctx.handle.dispatch(GroupsCommand::Open).await?;
    ctx.handle
        .take_from(rx, |action| {
            matches!(action, Action::Event(Event::Groups(GroupsEvent::Opened)))
        })
        .await?;

    let Some(client) = ctx.handle.select(|state| state.client.clone()).await? else {
        return Err(CoreError::Invariant(
            "tried to open the account before the client started".to_string(),
        ));
    };
    ctx.handle
        .dispatch(GroupsCommand::Subscribe(SubscribeOptions {
            public_key: client.account_group_pk.clone(),
            metadata: true,
            messages: false,
        }))
        .await?;

    ctx.protocol
        .instance_shareable_id(false, &account.name)
        .await?;

    let reference = ctx.protocol.contact_request_reference().await?;
    if !reference.public_rendezvous_seed.is_empty() {
        ctx.handle
            .dispatch(AccountEvent::RdvSeedUpdated {
                seed: reference.public_rendezvous_seed,
            })
            .await?;
    }
    Ok(())
}

async fn tx_create(ctx: &Ctx, name: String, node_config: NodeConfig) -> Result<(), CoreError> {
    ctx.handle
        .dispatch(SettingsEvent::NodeConfigSet(node_config))
        .await?;
    ctx.handle.dispatch(AccountEvent::Created { name }).await
}

/// Tear the account down: stop listeners, stop the native service, wipe its
/// storage, then wipe our own.
async fn tx_delete(ctx: &Ctx) -> Result<(), CoreError> {
    ctx.handle.dispatch(AccountEvent::Unboarded).await?;
    ctx.handle.dispatch(Control::StopClient).await?;
    ctx.bridge.stop().await?;
    ctx.bridge.clear_storage().await?;
    ctx.handle.dispatch(Control::ClearStore).await
}

async fn tx_send_contact_request(
    ctx: &Ctx,
    contact_name: String,
    contact_public_key: PublicKey,
    contact_rdv_seed: String,
) -> Result<(), CoreError> {
    let Some(account) = ctx
        .handle
        .select(|state| state.messenger.account.clone())
        .await?
    else {
        return Err(CoreError::AccountMissing);
    };

    let metadata = serde_json::to_vec(&ContactMetadata { name: contact_name })?;
    let own_metadata = serde_json::to_vec(&ContactMetadata { name: account.name })?;
    ctx.protocol
        .contact_request_send(ContactRequestSendRequest {
            contact: ContactRef {
                pk: contact_public_key,
                public_rendezvous_seed: contact_rdv_seed,
                metadata,
            },
            own_metadata,
        })
        .await?;
    Ok(())
}

async fn tx_handle_deep_link(ctx: &Ctx, link: String) -> Result<(), CoreError> {
    // Links can arrive before the engine is up; hold them until then.
    let rx = ctx.handle.subscribe();
    if ctx
        .handle
        .select(|state| state.client.is_none())
        .await?
    {
        ctx.handle
            .take_from(rx, |action| {
                matches!(action, Action::Control(Control::AppReady))
            })
            .await?;
    }

    let parsed = match ctx.protocol.parse_deep_link(&link).await {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(%error, "deep link rejected by the service");
            return ctx
                .handle
                .dispatch(AccountEvent::DeepLinkError {
                    link,
                    error: "Corrupted deep link.".to_string(),
                })
                .await;
        }
    };
    let kind = match parsed {
        DeepLink::Group(_) => {
            conversation::tx_join(ctx, &link).await?;
            DeepLinkKind::Group
        }
        DeepLink::Id(_) => {
            contact::tx_initiate_request(ctx, &link).await?;
            DeepLinkKind::Contact
        }
    };
    ctx.handle
        .dispatch(AccountEvent::DeepLinkDone { link, kind })
        .await
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

pub fn slice() -> Result<Slice, ConfigError> {
    Slice::build(SliceDef {
        name: "account",
        effects: vec![EffectDef::new(
            "commands",
            |action| matches!(action, Action::Command(Command::Account(_))),
            handle_command,
        )],
    })
}

async fn handle_command(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Command(Command::Account(command)) = action else {
        return Ok(());
    };
    match command {
        AccountCommand::Open => tx_open(&ctx).await,
        AccountCommand::Create { name, node_config } => tx_create(&ctx, name, node_config).await,
        AccountCommand::Delete => tx_delete(&ctx).await,
        AccountCommand::Onboard => ctx.handle.dispatch(AccountEvent::Onboarded).await,
        AccountCommand::SendContactRequest {
            contact_name,
            contact_public_key,
            contact_rdv_seed,
        } => {
            tx_send_contact_request(&ctx, contact_name, contact_public_key, contact_rdv_seed).await
        }
        AccountCommand::HandleDeepLink { link } => tx_handle_deep_link(&ctx, link).await,
    }
}
