//! Contact slice: the contact-request lifecycle on both sides.
//!
//! Request state is a projection of account-group metadata events; the only
//! signal that an outgoing request was accepted without the peer sending a
//! message is a foreign member device joining the 1:1 group, so one effect
//! infers acceptance from that.

use chrono::{DateTime, Utc};
use tracing::warn;

use courrier_proto::types::{ContactMetadata, GroupInfoRequest, MetadataEvent};
use courrier_shared::constants::DEFAULT_DISPLAY_NAME;
use courrier_shared::deeplink::{DeepLink, IdLink};
use courrier_shared::message::AppMessage;
use courrier_shared::types::{GroupType, MessageId, PublicKey};

use crate::action::{Action, Command, ProtocolAction};
use crate::conversation::{self, ConversationEvent};
use crate::error::{ConfigError, CoreError};
use crate::groups::{GroupsCommand, SubscribeOptions};
use crate::slice::{Ctx, EffectDef, Slice, SliceDef};
use crate::state::{
    AppState, Contact, ContactRequest, ContactRequestKind, ContactState, ConversationKind,
    RequestDraft, RequestState,
};

#[derive(Debug, Clone)]
pub enum ContactCommand {
    AcceptRequest { id: PublicKey },
    DiscardRequest { id: PublicKey },
    InitiateRequest { link: String },
    Delete { id: PublicKey },
    DeleteAll,
}

#[derive(Debug, Clone)]
pub enum ContactEvent {
    /// Insert-if-absent of a full contact aggregate.
    Created(Contact),
    Deleted {
        contact_pk: PublicKey,
    },
    OutgoingRequestAccepted {
        contact_pk: PublicKey,
    },
    OutgoingRequestEnqueued {
        contact_pk: PublicKey,
        group_pk: Option<PublicKey>,
        name: String,
        uid: Option<MessageId>,
        added_date: DateTime<Utc>,
    },
    OutgoingRequestSent {
        contact_pk: PublicKey,
        group_pk: Option<PublicKey>,
        date: DateTime<Utc>,
    },
    /// Outcome of resolving a contact deep link; failures land on the draft.
    RequestInitiated {
        id: Option<IdLink>,
        error: Option<String>,
        now: DateTime<Utc>,
    },
    DraftReset,
    IncomingRequestAccepted {
        contact_pk: PublicKey,
        group_pk: Option<PublicKey>,
    },
    IncomingRequestDiscarded {
        contact_pk: PublicKey,
    },
    /// Acceptance regardless of request kind (missed-signal compensation).
    RequestAccepted {
        contact_pk: PublicKey,
    },
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

pub(crate) fn reduce(state: &mut ContactState, event: &ContactEvent) {
    match event {
        ContactEvent::Created(contact) => {
            state
                .entities
                .entry(contact.id.clone())
                .or_insert_with(|| contact.clone());
        }
        ContactEvent::Deleted { contact_pk } => {
            state.entities.remove(contact_pk);
        }
        ContactEvent::OutgoingRequestAccepted { contact_pk } => {
            if let Some(contact) = state.entities.get_mut(contact_pk) {
                if contact.request.kind == ContactRequestKind::Outgoing {
                    contact.request.accepted = true;
                }
            }
        }
        ContactEvent::OutgoingRequestEnqueued {
            contact_pk,
            group_pk,
            name,
            uid,
            added_date,
        } => {
            // An initiated entity keeps its state; only absent contacts are
            // created here.
            state.entities.entry(contact_pk.clone()).or_insert_with(|| Contact {
                id: contact_pk.clone(),
                name: name.clone(),
                public_key: contact_pk.clone(),
                group_pk: group_pk.clone(),
                fake: false,
                added_date: *added_date,
                request: ContactRequest {
                    kind: ContactRequestKind::Outgoing,
                    accepted: false,
                    discarded: false,
                    state: RequestState::Enqueued,
                    sent_date: None,
                    uid: uid.clone(),
                },
            });
        }
        ContactEvent::OutgoingRequestSent {
            contact_pk,
            group_pk,
            date,
        } => {
            if let Some(contact) = state.entities.get_mut(contact_pk) {
                if contact.request.kind != ContactRequestKind::Outgoing {
                    return;
                }
                contact.request.state = RequestState::Sent;
                contact.request.sent_date = Some(*date);
                if contact.group_pk.is_none() {
                    contact.group_pk = group_pk.clone();
                }
            }
        }
        ContactEvent::RequestInitiated { id, error, now } => {
            apply_request_initiated(state, id, error, *now);
        }
        ContactEvent::DraftReset => {
            state.request_draft = None;
        }
        ContactEvent::IncomingRequestAccepted {
            contact_pk,
            group_pk,
        } => {
            if let Some(contact) = state.entities.get_mut(contact_pk) {
                if contact.request.kind == ContactRequestKind::Incoming {
                    contact.request.accepted = true;
                    contact.group_pk = group_pk.clone();
                }
            }
        }
        ContactEvent::IncomingRequestDiscarded { contact_pk } => {
            if let Some(contact) = state.entities.get_mut(contact_pk) {
                if contact.request.kind == ContactRequestKind::Incoming {
                    contact.request.discarded = true;
                }
            }
        }
        ContactEvent::RequestAccepted { contact_pk } => {
            if let Some(contact) = state.entities.get_mut(contact_pk) {
                contact.request.accepted = true;
            }
        }
    }
}

fn apply_request_initiated(
    state: &mut ContactState,
    id: &Option<IdLink>,
    error: &Option<String>,
    now: DateTime<Utc>,
) {
    let outcome = (|| -> Result<(), String> {
        let id = match (id, error) {
            (Some(id), None) => id,
            (_, Some(error)) => return Err(error.clone()),
            (None, None) => return Err("Unknown.".to_string()),
        };
        if id.account_pk.as_str().is_empty() || id.public_rendezvous_seed.is_empty() {
            return Err("Invalid payload.".to_string());
        }
        let contact_pk = id.account_pk.clone();
        if state.entities.contains_key(&contact_pk) {
            return Err("Contact already added.".to_string());
        }
        let name = id
            .display_name
            .clone()
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());
        state.request_draft = Some(RequestDraft::Resolved {
            contact_id: contact_pk.clone(),
            contact_name: name.clone(),
            contact_rdv_seed: id.public_rendezvous_seed.clone(),
            contact_public_key: contact_pk.clone(),
        });
        state.entities.insert(
            contact_pk.clone(),
            Contact {
                id: contact_pk.clone(),
                name,
                public_key: contact_pk,
                group_pk: None,
                fake: false,
                added_date: now,
                request: ContactRequest {
                    kind: ContactRequestKind::Outgoing,
                    accepted: false,
                    discarded: false,
                    state: RequestState::Initiated,
                    sent_date: None,
                    uid: None,
                },
            },
        );
        Ok(())
    })();
    if let Err(error) = outcome {
        state.request_draft = Some(RequestDraft::Failed { error });
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub mod queries {
    use super::*;

    pub fn list(state: &AppState) -> Vec<&Contact> {
        state.messenger.contact.entities.values().collect()
    }

    pub fn get<'a>(state: &'a AppState, id: &PublicKey) -> Option<&'a Contact> {
        state.messenger.contact.entities.get(id)
    }

    pub fn request_draft(state: &AppState) -> Option<&RequestDraft> {
        state.messenger.contact.request_draft.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Resolve the 1:1 group backing a contact. Lookup failures are logged and
/// treated as "unknown yet".
pub(crate) async fn contact_pk_to_group_pk(ctx: &Ctx, contact_pk: &PublicKey) -> Option<PublicKey> {
    let request = GroupInfoRequest {
        contact_pk: Some(contact_pk.clone()),
        group_pk: None,
    };
    match ctx.protocol.group_info(request).await {
        Ok(reply) => reply.group.map(|g| g.public_key),
        Err(error) => {
            warn!(contact = %contact_pk.short(), %error, "group lookup for contact failed");
            None
        }
    }
}

pub(crate) async fn tx_delete(ctx: &Ctx, id: &PublicKey) -> Result<(), CoreError> {
    let lookup = id.clone();
    let Some(contact) = ctx
        .handle
        .select(move |state| queries::get(state, &lookup).cloned())
        .await?
    else {
        return Ok(());
    };

    if let Some(group_pk) = contact_pk_to_group_pk(ctx, &contact.public_key).await {
        ctx.handle
            .dispatch(GroupsCommand::Unsubscribe(SubscribeOptions {
                public_key: group_pk,
                metadata: true,
                messages: true,
            }))
            .await?;
    }

    let contact_id = id.clone();
    let paired: Vec<PublicKey> = ctx
        .handle
        .select(move |state| {
            conversation::queries::list(state)
                .into_iter()
                .filter(|c| {
                    c.kind == ConversationKind::OneToOne
                        && c.contact_id.as_ref() == Some(&contact_id)
                })
                .map(|c| c.id.clone())
                .collect()
        })
        .await?;
    for conversation_id in paired {
        conversation::tx_delete(ctx, &conversation_id).await?;
    }

    ctx.handle
        .dispatch(ContactEvent::Deleted {
            contact_pk: contact.public_key,
        })
        .await
}

async fn tx_accept_request(ctx: &Ctx, id: &PublicKey) -> Result<(), CoreError> {
    let lookup = id.clone();
    let Some(contact) = ctx
        .handle
        .select(move |state| queries::get(state, &lookup).cloned())
        .await?
    else {
        return Ok(());
    };
    ctx.protocol
        .contact_request_accept(&contact.public_key)
        .await?;
    Ok(())
}

/// Block the contact, wait for the resulting deletion round trip, then
/// unblock so the key is not permanently banned.
async fn tx_discard_request(ctx: &Ctx, id: &PublicKey) -> Result<(), CoreError> {
    let lookup = id.clone();
    let Some(contact) = ctx
        .handle
        .select(move |state| queries::get(state, &lookup).cloned())
        .await?
    else {
        return Ok(());
    };

    // Subscribe before blocking so the deleted event cannot slip past.
    let rx = ctx.handle.subscribe();
    ctx.protocol.contact_block(&contact.public_key).await?;
    let expected = contact.public_key.clone();
    ctx.handle
        .take_from(rx, |action| {
            matches!(
                action,
                Action::Event(crate::action::Event::Contact(ContactEvent::Deleted { contact_pk }))
                    if *contact_pk == expected
            )
        })
        .await?;
    ctx.protocol.contact_unblock(&contact.public_key).await?;
    Ok(())
}

async fn tx_delete_all(ctx: &Ctx) -> Result<(), CoreError> {
    let ids: Vec<PublicKey> = ctx
        .handle
        .select(|state| queries::list(state).into_iter().map(|c| c.id.clone()).collect())
        .await?;
    for id in ids {
        tx_delete(ctx, &id).await?;
    }
    Ok(())
}

pub(crate) async fn tx_initiate_request(ctx: &Ctx, link: &str) -> Result<(), CoreError> {
    let now = Utc::now();
    let fail = |error: String| ContactEvent::RequestInitiated {
        id: None,
        error: Some(error),
        now,
    };

    let parsed = match ctx.protocol.parse_deep_link(link).await {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(%error, "deep link rejected by the service");
            return ctx
                .handle
                .dispatch(fail("Corrupted deep link.".to_string()))
                .await;
        }
    };
    let DeepLink::Id(id) = parsed else {
        return ctx
            .handle
            .dispatch(fail("Internal: Invalid node response.".to_string()))
            .await;
    };

    let Some(client) = ctx.handle.select(|state| state.client.clone()).await? else {
        return Ok(());
    };
    if id.account_pk == client.account_pk {
        return ctx
            .handle
            .dispatch(fail("Can't send a contact request to yourself.".to_string()))
            .await;
    }
    let contact_pk = id.account_pk.clone();
    let known = ctx
        .handle
        .select(move |state| queries::get(state, &contact_pk).is_some())
        .await?;
    if known {
        return ctx
            .handle
            .dispatch(fail("Contact already added.".to_string()))
            .await;
    }

    ctx.handle
        .dispatch(ContactEvent::RequestInitiated {
            id: Some(id),
            error: None,
            now,
        })
        .await
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

pub fn slice() -> Result<Slice, ConfigError> {
    Slice::build(SliceDef {
        name: "contact",
        effects: vec![
            EffectDef::new(
                "commands",
                |action| matches!(action, Action::Command(Command::Contact(_))),
                handle_command,
            ),
            EffectDef::new(
                "outgoing-request-enqueued",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::ContactRequestOutgoingEnqueued { .. })
                    )
                },
                handle_outgoing_enqueued,
            ),
            EffectDef::new(
                "incoming-request-received",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::ContactRequestIncomingReceived { .. })
                    )
                },
                handle_incoming_received,
            ),
            EffectDef::new(
                "incoming-request-accepted",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::ContactRequestIncomingAccepted { .. })
                    )
                },
                handle_incoming_accepted,
            ),
            EffectDef::new(
                "incoming-request-discarded",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::ContactRequestIncomingDiscarded { .. })
                    )
                },
                handle_incoming_discarded,
            ),
            EffectDef::new(
                "outgoing-request-sent",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::ContactRequestOutgoingSent { .. })
                    )
                },
                handle_outgoing_sent,
            ),
            EffectDef::new(
                "group-invitation",
                |action| matches!(action, Action::Protocol(ProtocolAction::GroupMessage(_))),
                handle_group_invitation,
            ),
            EffectDef::new(
                "device-join-acceptance",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::MemberDeviceAdded { .. })
                    )
                },
                handle_device_join,
            ),
            EffectDef::new(
                "contact-blocked",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::ContactBlocked { .. })
                    )
                },
                handle_contact_blocked,
            ),
        ],
    })
}

async fn handle_command(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Command(Command::Contact(command)) = action else {
        return Ok(());
    };
    match command {
        ContactCommand::AcceptRequest { id } => tx_accept_request(&ctx, &id).await,
        ContactCommand::DiscardRequest { id } => tx_discard_request(&ctx, &id).await,
        ContactCommand::InitiateRequest { link } => tx_initiate_request(&ctx, &link).await,
        ContactCommand::Delete { id } => tx_delete(&ctx, &id).await,
        ContactCommand::DeleteAll => tx_delete_all(&ctx).await,
    }
}

async fn handle_outgoing_enqueued(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::ContactRequestOutgoingEnqueued { contact } = envelope.event else {
        return Ok(());
    };

    let Some(group_pk) = contact_pk_to_group_pk(&ctx, &contact.pk).await else {
        return Ok(());
    };
    let metadata: ContactMetadata = serde_json::from_slice(&contact.metadata)?;
    ctx.handle
        .dispatch(ContactEvent::OutgoingRequestEnqueued {
            contact_pk: contact.pk,
            group_pk: Some(group_pk.clone()),
            name: metadata.name,
            uid: envelope.event_context.id,
            added_date: Utc::now(),
        })
        .await?;
    ctx.protocol.activate_group(&group_pk).await?;
    ctx.handle
        .dispatch(GroupsCommand::Subscribe(SubscribeOptions {
            public_key: group_pk,
            metadata: true,
            messages: true,
        }))
        .await
}

async fn handle_incoming_received(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::ContactRequestIncomingReceived {
        contact_pk,
        contact_metadata,
    } = envelope.event
    else {
        return Ok(());
    };

    let lookup = contact_pk.clone();
    if ctx
        .handle
        .select(move |state| queries::get(state, &lookup).is_some())
        .await?
    {
        return Ok(());
    }
    let metadata: ContactMetadata = match serde_json::from_slice(&contact_metadata) {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!(contact = %contact_pk.short(), %error, "invalid contact metadata");
            return Ok(());
        }
    };
    ctx.handle
        .dispatch(ContactEvent::Created(Contact {
            id: contact_pk.clone(),
            name: metadata.name,
            public_key: contact_pk,
            group_pk: None,
            fake: false,
            added_date: Utc::now(),
            request: ContactRequest {
                kind: ContactRequestKind::Incoming,
                accepted: false,
                discarded: false,
                state: RequestState::Received,
                sent_date: None,
                uid: None,
            },
        }))
        .await
}

async fn handle_incoming_accepted(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::ContactRequestIncomingAccepted {
        contact_pk,
        group_pk,
    } = envelope.event
    else {
        return Ok(());
    };

    let group_pk = match group_pk {
        Some(group_pk) => group_pk,
        None => match contact_pk_to_group_pk(&ctx, &contact_pk).await {
            Some(group_pk) => group_pk,
            None => {
                warn!(contact = %contact_pk.short(), "no group for accepted contact request");
                return tx_delete(&ctx, &contact_pk).await;
            }
        },
    };

    let lookup = contact_pk.clone();
    let Some(contact) = ctx
        .handle
        .select(move |state| queries::get(state, &lookup).cloned())
        .await?
    else {
        return Ok(());
    };

    conversation::tx_create_one_to_one(&ctx, contact.id.clone(), contact.name.clone(), group_pk.clone(), Utc::now())
        .await?;
    ctx.protocol.activate_group(&group_pk).await?;
    ctx.handle
        .dispatch(GroupsCommand::Subscribe(SubscribeOptions {
            public_key: group_pk.clone(),
            metadata: true,
            messages: true,
        }))
        .await?;
    ctx.handle
        .dispatch(ContactEvent::IncomingRequestAccepted {
            contact_pk,
            group_pk: Some(group_pk),
        })
        .await
}

async fn handle_incoming_discarded(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::ContactRequestIncomingDiscarded { contact_pk } = envelope.event else {
        return Ok(());
    };
    ctx.handle
        .dispatch(ContactEvent::IncomingRequestDiscarded { contact_pk })
        .await
}

async fn handle_outgoing_sent(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::ContactRequestOutgoingSent { contact_pk } = envelope.event else {
        return Ok(());
    };

    let lookup = contact_pk.clone();
    let Some(contact) = ctx
        .handle
        .select(move |state| queries::get(state, &lookup).cloned())
        .await?
    else {
        return Ok(());
    };
    if contact.request.kind != ContactRequestKind::Outgoing {
        return Ok(());
    }

    let group_pk = contact_pk_to_group_pk(&ctx, &contact_pk).await;
    ctx.handle
        .dispatch(ContactEvent::OutgoingRequestSent {
            contact_pk: contact_pk.clone(),
            group_pk: group_pk.clone(),
            date: Utc::now(),
        })
        .await?;

    if let Some(group_pk) = group_pk {
        if contact.request.state == RequestState::Initiated {
            conversation::tx_create_one_to_one(
                &ctx,
                contact.id.clone(),
                contact.name.clone(),
                group_pk.clone(),
                Utc::now(),
            )
            .await?;
            ctx.protocol.activate_group(&group_pk).await?;
            ctx.handle
                .dispatch(GroupsCommand::Subscribe(SubscribeOptions {
                    public_key: group_pk,
                    metadata: true,
                    messages: true,
                }))
                .await?;
        }
    }
    Ok(())
}

async fn handle_group_invitation(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMessage(envelope)) = action else {
        return Ok(());
    };
    let Ok(AppMessage::GroupInvitation { name, group }) = AppMessage::from_bytes(&envelope.message)
    else {
        return Ok(());
    };
    if group.group_type != GroupType::MultiMember {
        return Ok(());
    }

    ctx.handle
        .dispatch(ConversationEvent::Created {
            pk: group.public_key.clone(),
            kind: ConversationKind::MultiMember,
            title: name,
            contact_id: None,
            shareable_group: None,
            created_at: Utc::now(),
            members: Vec::new(),
        })
        .await?;

    if let Err(error) = ctx.protocol.multi_member_group_join(group.clone()).await {
        warn!(group = %group.public_key.short(), %error, "failed to join invited group");
    }

    ctx.handle
        .dispatch(GroupsCommand::Subscribe(SubscribeOptions {
            public_key: group.public_key,
            metadata: true,
            messages: true,
        }))
        .await
}

async fn handle_device_join(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::MemberDeviceAdded { member_pk, .. } = envelope.event else {
        return Ok(());
    };
    let Some(group_pk) = envelope.event_context.group_pk else {
        return Ok(());
    };

    let Some(client) = ctx.handle.select(|state| state.client.clone()).await? else {
        return Ok(());
    };
    // A device of ours joining proves nothing about the peer.
    if member_pk == client.account_pk {
        return Ok(());
    }

    let pending = ctx
        .handle
        .select(move |state| {
            queries::list(state)
                .into_iter()
                .find(|c| {
                    c.request.kind == ContactRequestKind::Outgoing
                        && c.group_pk.as_ref() == Some(&group_pk)
                        && !c.request.accepted
                })
                .map(|c| c.public_key.clone())
        })
        .await?;
    if let Some(contact_pk) = pending {
        ctx.handle
            .dispatch(ContactEvent::OutgoingRequestAccepted { contact_pk })
            .await?;
    }
    Ok(())
}

async fn handle_contact_blocked(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::ContactBlocked { contact_pk } = envelope.event else {
        return Ok(());
    };
    tx_delete(&ctx, &contact_pk).await
}
