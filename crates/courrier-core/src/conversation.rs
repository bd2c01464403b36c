//! Conversation slice: 1:1 and multi-member conversation aggregates.

use chrono::{DateTime, Utc};
use tracing::warn;

use courrier_proto::types::{ContactMetadata, GroupInfoRequest, MetadataEvent};
use courrier_shared::constants::UNKNOWN_CONVERSATION_TITLE;
use courrier_shared::message::AppMessage;
use courrier_shared::types::{GroupType, MessageId, PublicKey};

use crate::action::{Action, Command, ProtocolAction};
use crate::contact::{self, ContactEvent};
use crate::error::{ConfigError, CoreError};
use crate::groups::{self, GroupsCommand, SubscribeOptions};
use crate::slice::{Ctx, EffectDef, Slice, SliceDef};
use crate::state::{AppState, Conversation, ConversationKind, ConversationState};

#[derive(Debug, Clone)]
pub enum ConversationCommand {
    /// Create a multi-member group and invite the given contacts.
    Create {
        name: String,
        members: Vec<PublicKey>,
    },
    Join {
        link: String,
    },
    Delete {
        id: PublicKey,
    },
    DeleteAll,
    AddMessage {
        id: PublicKey,
        message_id: MessageId,
        is_me: bool,
    },
    StartRead(PublicKey),
    StopRead(PublicKey),
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Created {
        pk: PublicKey,
        kind: ConversationKind,
        title: String,
        contact_id: Option<PublicKey>,
        shareable_group: Option<String>,
        created_at: DateTime<Utc>,
        members: Vec<PublicKey>,
    },
    Deleted {
        id: PublicKey,
    },
    NameUpdated {
        id: PublicKey,
        name: String,
        shareable_group: Option<String>,
    },
    UserNameUpdated {
        id: PublicKey,
        member_pk: PublicKey,
        user_name: String,
    },
    MessageAdded {
        id: PublicKey,
        message_id: MessageId,
        is_me: bool,
        last_message_date: DateTime<Utc>,
    },
    StartRead(PublicKey),
    StopRead(PublicKey),
    /// Engine restart marker; every conversation leaves reading mode.
    AppInit,
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

pub(crate) fn reduce(state: &mut ConversationState, event: &ConversationEvent) {
    match event {
        ConversationEvent::Created {
            pk,
            kind,
            title,
            contact_id,
            shareable_group,
            created_at,
            members,
        } => {
            if let Some(conversation) = state.aggregates.get_mut(pk) {
                // A second creation only refines what a placeholder left
                // unresolved.
                if shareable_group.is_some() {
                    conversation.shareable_group = shareable_group.clone();
                }
                if !title.is_empty() && title != UNKNOWN_CONVERSATION_TITLE {
                    conversation.title = title.clone();
                }
                return;
            }
            if !matches!(kind, ConversationKind::OneToOne | ConversationKind::MultiMember) {
                return;
            }
            state.aggregates.insert(
                pk.clone(),
                Conversation {
                    id: pk.clone(),
                    pk: pk.clone(),
                    kind: *kind,
                    title: title.clone(),
                    contact_id: if *kind == ConversationKind::OneToOne {
                        contact_id.clone()
                    } else {
                        None
                    },
                    fake: false,
                    shareable_group: shareable_group.clone(),
                    created_at: *created_at,
                    members: members.clone(),
                    messages: Vec::new(),
                    members_names: Default::default(),
                    unread_count: 0,
                    reading: false,
                    last_message_date: None,
                    last_sent_message: None,
                },
            );
        }
        ConversationEvent::Deleted { id } => {
            state.aggregates.remove(id);
        }
        ConversationEvent::NameUpdated {
            id,
            name,
            shareable_group,
        } => {
            if let Some(conversation) = state.aggregates.get_mut(id) {
                conversation.title = name.clone();
                if shareable_group.is_some() {
                    conversation.shareable_group = shareable_group.clone();
                }
            }
        }
        ConversationEvent::UserNameUpdated {
            id,
            member_pk,
            user_name,
        } => {
            if let Some(conversation) = state.aggregates.get_mut(id) {
                conversation
                    .members_names
                    .entry(member_pk.clone())
                    .or_insert_with(|| user_name.clone());
            }
        }
        ConversationEvent::MessageAdded {
            id,
            message_id,
            is_me,
            last_message_date,
        } => {
            if let Some(conversation) = state.aggregates.get_mut(id) {
                conversation.messages.push(message_id.clone());
                if *is_me {
                    conversation.last_sent_message = Some(message_id.clone());
                } else if !conversation.reading {
                    conversation.unread_count += 1;
                }
                conversation.last_message_date = Some(*last_message_date);
            }
        }
        ConversationEvent::StartRead(id) => {
            if let Some(conversation) = state.aggregates.get_mut(id) {
                conversation.unread_count = 0;
                conversation.reading = true;
            }
        }
        ConversationEvent::StopRead(id) => {
            if let Some(conversation) = state.aggregates.get_mut(id) {
                conversation.reading = false;
            }
        }
        ConversationEvent::AppInit => {
            for conversation in state.aggregates.values_mut() {
                conversation.reading = false;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub mod queries {
    use super::*;

    pub fn list(state: &AppState) -> Vec<&Conversation> {
        state.messenger.conversation.aggregates.values().collect()
    }

    pub fn get<'a>(state: &'a AppState, id: &PublicKey) -> Option<&'a Conversation> {
        state.messenger.conversation.aggregates.get(id)
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

pub(crate) async fn tx_open(ctx: &Ctx) -> Result<(), CoreError> {
    ctx.handle.dispatch(ConversationEvent::AppInit).await
}

/// Create (or refine) the 1:1 conversation backing a contact.
///
/// Seeing more than one member device in the group means the peer's side is
/// in it, so a still-pending outgoing request is promoted to accepted even
/// if the explicit signal was missed.
pub(crate) async fn tx_create_one_to_one(
    ctx: &Ctx,
    contact_id: PublicKey,
    title: String,
    pk: PublicKey,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let group_pk = pk.clone();
    let contact_lookup = contact_id.clone();
    let pending = ctx
        .handle
        .select(move |state| {
            let devices = groups::queries::get(state, &group_pk)
                .map(|g| g.members_devices.len())
                .unwrap_or(0);
            if devices <= 1 {
                return None;
            }
            contact::queries::get(state, &contact_lookup)
                .filter(|c| !c.request.accepted)
                .map(|c| c.id.clone())
        })
        .await?;
    if let Some(contact_pk) = pending {
        ctx.handle
            .dispatch(ContactEvent::RequestAccepted { contact_pk })
            .await?;
    }

    ctx.handle
        .dispatch(ConversationEvent::Created {
            pk,
            kind: ConversationKind::OneToOne,
            title,
            contact_id: Some(contact_id),
            shareable_group: None,
            created_at: now,
            members: Vec::new(),
        })
        .await
}

pub(crate) async fn tx_delete(ctx: &Ctx, id: &PublicKey) -> Result<(), CoreError> {
    let lookup = id.clone();
    let Some(conversation) = ctx
        .handle
        .select(move |state| queries::get(state, &lookup).cloned())
        .await?
    else {
        return Ok(());
    };
    ctx.handle
        .dispatch(GroupsCommand::Unsubscribe(SubscribeOptions {
            public_key: conversation.pk,
            metadata: true,
            messages: true,
        }))
        .await?;
    ctx.handle
        .dispatch(ConversationEvent::Deleted { id: id.clone() })
        .await
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

async fn tx_create(ctx: &Ctx, name: String, members: Vec<PublicKey>) -> Result<(), CoreError> {
    let create_reply = ctx.protocol.multi_member_group_create().await?;
    let group_pk = create_reply.group_pk;

    let invitation_reply = ctx
        .protocol
        .multi_member_group_invitation_create(&group_pk)
        .await?;
    let Some(group) = invitation_reply.group else {
        warn!("no group in invitation reply");
        return Ok(());
    };
    if group.public_key.as_str().is_empty()
        || group.secret.is_empty()
        || group.secret_sig.is_empty()
        || group.group_type != GroupType::MultiMember
    {
        warn!("malformed group in invitation reply");
        return Ok(());
    }

    let set_group_name = AppMessage::SetGroupName { name: name.clone() };
    ctx.protocol
        .app_metadata_send(&group_pk, set_group_name.to_bytes()?)
        .await?;

    ctx.handle
        .dispatch(GroupsCommand::Subscribe(SubscribeOptions {
            public_key: group_pk.clone(),
            metadata: true,
            messages: true,
        }))
        .await?;

    let link_reply = ctx.protocol.shareable_group(&group_pk, &name).await?;
    ctx.handle
        .dispatch(ConversationEvent::Created {
            pk: group_pk.clone(),
            kind: ConversationKind::MultiMember,
            title: name.clone(),
            contact_id: None,
            shareable_group: Some(link_reply.deep_link),
            created_at: Utc::now(),
            members: Vec::new(),
        })
        .await?;

    let Some(account) = ctx
        .handle
        .select(|state| state.messenger.account.clone())
        .await?
    else {
        warn!("no account while creating a conversation");
        return Ok(());
    };
    publish_own_member_name(ctx, &group_pk, &account.name).await?;

    let invitation = AppMessage::GroupInvitation {
        name: name.clone(),
        group: group.clone(),
    };
    let payload = invitation.to_bytes()?;
    for member_id in members {
        let lookup = member_id.clone();
        let Some(member) = ctx
            .handle
            .select(move |state| contact::queries::get(state, &lookup).cloned())
            .await?
        else {
            continue;
        };
        let one_to_one_pk = match member.group_pk.clone() {
            Some(pk) => Some(pk),
            None => contact::contact_pk_to_group_pk(ctx, &member.public_key).await,
        };
        match one_to_one_pk {
            Some(pk) => ctx.protocol.app_message_send(&pk, payload.clone()).await?,
            None => warn!(
                contact = %member.public_key.short(),
                "skipping group invitation, contact has no established 1:1"
            ),
        }
    }
    Ok(())
}

pub(crate) async fn tx_join(ctx: &Ctx, link: &str) -> Result<(), CoreError> {
    let parsed = match ctx.protocol.parse_deep_link(link).await {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(%error, "failed to join multi-member group");
            return Ok(());
        }
    };
    let courrier_shared::deeplink::DeepLink::Group(group_link) = parsed else {
        warn!("failed to join multi-member group: invalid link");
        return Ok(());
    };
    if group_link.display_name.is_empty() || group_link.group.public_key.as_str().is_empty() {
        warn!("failed to join multi-member group: invalid link");
        return Ok(());
    }

    ctx.handle
        .dispatch(ConversationEvent::Created {
            pk: group_link.group.public_key.clone(),
            kind: ConversationKind::MultiMember,
            title: group_link.display_name,
            contact_id: None,
            shareable_group: None,
            created_at: Utc::now(),
            members: Vec::new(),
        })
        .await?;
    if let Err(error) = ctx.protocol.multi_member_group_join(group_link.group).await {
        warn!(%error, "failed to join multi-member group");
    }
    Ok(())
}

/// Announce our display name inside a group via an application metadata
/// payload.
async fn publish_own_member_name(
    ctx: &Ctx,
    group_pk: &PublicKey,
    name: &str,
) -> Result<(), CoreError> {
    let info = ctx
        .protocol
        .group_info(GroupInfoRequest {
            group_pk: Some(group_pk.clone()),
            contact_pk: None,
        })
        .await?;
    let Some(member_pk) = info.member_pk else {
        warn!(group = %group_pk.short(), "no member key for group, not announcing name");
        return Ok(());
    };
    let set_user_name = AppMessage::SetUserName {
        user_name: name.to_string(),
        member_pk,
    };
    ctx.protocol
        .app_metadata_send(group_pk, set_user_name.to_bytes()?)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

pub fn slice() -> Result<Slice, ConfigError> {
    Slice::build(SliceDef {
        name: "conversation",
        effects: vec![
            EffectDef::new(
                "commands",
                |action| matches!(action, Action::Command(Command::Conversation(_))),
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
                "group-joined",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::GroupJoined { .. })
                    )
                },
                handle_group_joined,
            ),
            EffectDef::new(
                "metadata-payload-sent",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::MetadataPayloadSent { .. })
                    )
                },
                handle_metadata_payload,
            ),
        ],
    })
}

async fn handle_command(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Command(Command::Conversation(command)) = action else {
        return Ok(());
    };
    match command {
        ConversationCommand::Create { name, members } => tx_create(&ctx, name, members).await,
        ConversationCommand::Join { link } => tx_join(&ctx, &link).await,
        ConversationCommand::Delete { id } => tx_delete(&ctx, &id).await,
        ConversationCommand::DeleteAll => tx_delete_all(&ctx).await,
        ConversationCommand::AddMessage {
            id,
            message_id,
            is_me,
        } => {
            ctx.handle
                .dispatch(ConversationEvent::MessageAdded {
                    id,
                    message_id,
                    is_me,
                    last_message_date: Utc::now(),
                })
                .await
        }
        ConversationCommand::StartRead(id) => {
            ctx.handle.dispatch(ConversationEvent::StartRead(id)).await
        }
        ConversationCommand::StopRead(id) => {
            ctx.handle.dispatch(ConversationEvent::StopRead(id)).await
        }
    }
}

async fn handle_outgoing_enqueued(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::ContactRequestOutgoingEnqueued { contact } = envelope.event else {
        return Ok(());
    };

    let Some(group_pk) = contact::contact_pk_to_group_pk(&ctx, &contact.pk).await else {
        return Ok(());
    };
    let metadata: ContactMetadata = serde_json::from_slice(&contact.metadata)?;
    tx_create_one_to_one(&ctx, contact.pk, metadata.name, group_pk, Utc::now()).await
}

async fn handle_group_joined(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::GroupJoined { group } = envelope.event else {
        return Ok(());
    };
    if group.group_type != GroupType::MultiMember || envelope.event_context.group_pk.is_none() {
        return Ok(());
    }
    let public_key = group.public_key.clone();

    ctx.protocol.activate_group(&public_key).await?;
    let shareable_group = match ctx
        .protocol
        .shareable_group(&public_key, UNKNOWN_CONVERSATION_TITLE)
        .await
    {
        Ok(reply) => Some(reply.deep_link),
        Err(error) => {
            warn!(group = %public_key.short(), %error, "failed to get deep link for group");
            None
        }
    };
    ctx.handle
        .dispatch(ConversationEvent::Created {
            pk: public_key.clone(),
            kind: ConversationKind::MultiMember,
            title: UNKNOWN_CONVERSATION_TITLE.to_string(),
            contact_id: None,
            shareable_group,
            created_at: Utc::now(),
            members: Vec::new(),
        })
        .await?;
    ctx.handle
        .dispatch(GroupsCommand::Subscribe(SubscribeOptions {
            public_key: public_key.clone(),
            metadata: true,
            messages: true,
        }))
        .await?;

    let Some(account) = ctx
        .handle
        .select(|state| state.messenger.account.clone())
        .await?
    else {
        warn!("account not found");
        return Ok(());
    };
    publish_own_member_name(&ctx, &public_key, &account.name).await
}

async fn handle_metadata_payload(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::MetadataPayloadSent { payload } = envelope.event else {
        return Ok(());
    };
    let Some(group_pk) = envelope.event_context.group_pk else {
        return Ok(());
    };

    let lookup = group_pk.clone();
    if ctx
        .handle
        .select(move |state| queries::get(state, &lookup).is_none())
        .await?
    {
        return Ok(());
    }

    let decoded = match AppMessage::from_bytes(&payload) {
        Ok(decoded) => decoded,
        Err(error) => {
            warn!(group = %group_pk.short(), %error, "undecodable metadata payload");
            return Ok(());
        }
    };
    match decoded {
        AppMessage::SetGroupName { name } => {
            let shareable_group = match ctx.protocol.shareable_group(&group_pk, &name).await {
                Ok(reply) => Some(reply.deep_link),
                Err(error) => {
                    warn!(group = %group_pk.short(), %error, "failed to get deep link for group");
                    None
                }
            };
            ctx.handle
                .dispatch(ConversationEvent::NameUpdated {
                    id: group_pk,
                    name,
                    shareable_group,
                })
                .await
        }
        AppMessage::SetUserName {
            user_name,
            member_pk,
        } => {
            ctx.handle
                .dispatch(ConversationEvent::UserNameUpdated {
                    id: group_pk,
                    member_pk,
                    user_name,
                })
                .await
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(s: &str) -> PublicKey {
        PublicKey::from(s)
    }

    fn created(pk_str: &str, title: &str, shareable: Option<&str>) -> ConversationEvent {
        ConversationEvent::Created {
            pk: pk(pk_str),
            kind: ConversationKind::MultiMember,
            title: title.into(),
            contact_id: None,
            shareable_group: shareable.map(|s| s.to_string()),
            created_at: Utc::now(),
            members: Vec::new(),
        }
    }

    #[test]
    fn created_is_idempotent_but_refines_placeholders() {
        let mut state = ConversationState::default();
        reduce(&mut state, &created("g1", UNKNOWN_CONVERSATION_TITLE, None));
        reduce(&mut state, &created("g1", "Alice", Some("courrier://group/#x")));

        let conversation = &state.aggregates[&pk("g1")];
        assert_eq!(conversation.title, "Alice");
        assert_eq!(
            conversation.shareable_group.as_deref(),
            Some("courrier://group/#x")
        );

        // A later placeholder never downgrades the resolved title.
        reduce(&mut state, &created("g1", UNKNOWN_CONVERSATION_TITLE, None));
        assert_eq!(state.aggregates[&pk("g1")].title, "Alice");
        assert_eq!(state.aggregates.len(), 1);
    }

    #[test]
    fn message_added_tracks_unread_and_last_sent() {
        let mut state = ConversationState::default();
        reduce(&mut state, &created("g1", "grp", None));

        let incoming = ConversationEvent::MessageAdded {
            id: pk("g1"),
            message_id: "m1".into(),
            is_me: false,
            last_message_date: Utc::now(),
        };
        reduce(&mut state, &incoming);
        assert_eq!(state.aggregates[&pk("g1")].unread_count, 1);

        reduce(&mut state, &ConversationEvent::StartRead(pk("g1")));
        assert_eq!(state.aggregates[&pk("g1")].unread_count, 0);
        reduce(&mut state, &incoming);
        // While reading, no unread accumulation.
        assert_eq!(state.aggregates[&pk("g1")].unread_count, 0);

        reduce(
            &mut state,
            &ConversationEvent::MessageAdded {
                id: pk("g1"),
                message_id: "m2".into(),
                is_me: true,
                last_message_date: Utc::now(),
            },
        );
        let conversation = &state.aggregates[&pk("g1")];
        assert_eq!(conversation.last_sent_message, Some("m2".into()));
        assert_eq!(conversation.messages.len(), 3);
    }

    #[test]
    fn member_names_are_first_write_wins() {
        let mut state = ConversationState::default();
        reduce(&mut state, &created("g1", "grp", None));
        reduce(
            &mut state,
            &ConversationEvent::UserNameUpdated {
                id: pk("g1"),
                member_pk: pk("m1"),
                user_name: "alice".into(),
            },
        );
        reduce(
            &mut state,
            &ConversationEvent::UserNameUpdated {
                id: pk("g1"),
                member_pk: pk("m1"),
                user_name: "impostor".into(),
            },
        );
        assert_eq!(state.aggregates[&pk("g1")].members_names[&pk("m1")], "alice");
    }

    #[test]
    fn app_init_resets_reading() {
        let mut state = ConversationState::default();
        reduce(&mut state, &created("g1", "grp", None));
        reduce(&mut state, &ConversationEvent::StartRead(pk("g1")));
        assert!(state.aggregates[&pk("g1")].reading);
        reduce(&mut state, &ConversationEvent::AppInit);
        assert!(!state.aggregates[&pk("g1")].reading);
    }
}
