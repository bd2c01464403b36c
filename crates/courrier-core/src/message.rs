//! Message slice: projection of group-message streams plus sending.
//!
//! Stream event ids double as message aggregate ids, which makes the
//! projection idempotent under redelivery. Acknowledgements for messages
//! that have not arrived yet are parked in a backlog and consumed when the
//! target lands.

use chrono::Utc;
use tracing::warn;

use courrier_proto::types::{GroupInfoRequest, MessageEnvelope};
use courrier_shared::message::{AppMessage, Attachment};
use courrier_shared::types::{MessageId, PublicKey};

use crate::action::{Action, Command, ProtocolAction};
use crate::conversation::{self, ConversationEvent};
use crate::error::{ConfigError, CoreError};
use crate::groups;
use crate::slice::{Ctx, EffectDef, Slice, SliceDef};
use crate::state::{AppState, InvitationMessage, Message, MessageState, UserMessage};

#[derive(Debug, Clone)]
pub enum MessageCommand {
    Send {
        /// Conversation to send into.
        id: PublicKey,
        body: String,
        attachments: Vec<Attachment>,
    },
    Delete {
        id: MessageId,
    },
}

#[derive(Debug, Clone)]
pub enum MessageEvent {
    Received {
        aggregate_id: MessageId,
        message: AppMessage,
        received_date: chrono::DateTime<Utc>,
        is_me: bool,
        member_pk: Option<PublicKey>,
    },
    Deleted {
        id: MessageId,
    },
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

pub(crate) fn reduce(state: &mut MessageState, event: &MessageEvent) {
    match event {
        MessageEvent::Received {
            aggregate_id,
            message,
            received_date,
            is_me,
            member_pk,
        } => {
            if state.aggregates.contains_key(aggregate_id) {
                return;
            }
            match message {
                AppMessage::UserMessage {
                    body,
                    attachments,
                    sent_date,
                } => {
                    let acknowledged = state.ack_backlog.remove(aggregate_id);
                    state.aggregates.insert(
                        aggregate_id.clone(),
                        Message::UserMessage(UserMessage {
                            id: aggregate_id.clone(),
                            body: body.clone(),
                            attachments: attachments.clone(),
                            sent_date: *sent_date,
                            received_date: *received_date,
                            acknowledged,
                            is_me: *is_me,
                            member_pk: member_pk.clone(),
                            fake: false,
                        }),
                    );
                }
                AppMessage::GroupInvitation { name, group } => {
                    state.aggregates.insert(
                        aggregate_id.clone(),
                        Message::GroupInvitation(InvitationMessage {
                            id: aggregate_id.clone(),
                            name: name.clone(),
                            group: group.clone(),
                            is_me: *is_me,
                            received_date: *received_date,
                            fake: false,
                        }),
                    );
                }
                AppMessage::Acknowledge { target } => {
                    // Our own outgoing acks say nothing about our messages.
                    if *is_me {
                        return;
                    }
                    match state.aggregates.get_mut(target) {
                        None => {
                            state.ack_backlog.insert(target.clone());
                        }
                        Some(Message::UserMessage(target)) if target.is_me => {
                            target.acknowledged = true;
                        }
                        Some(_) => {}
                    }
                }
                AppMessage::SetGroupName { .. } | AppMessage::SetUserName { .. } => {}
            }
        }
        MessageEvent::Deleted { id } => {
            state.aggregates.remove(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub mod queries {
    use super::*;

    pub fn get<'a>(state: &'a AppState, id: &MessageId) -> Option<&'a Message> {
        state.messenger.message.aggregates.get(id)
    }

    pub fn count(state: &AppState) -> usize {
        state.messenger.message.aggregates.len()
    }
}

// ---------------------------------------------------------------------------
// Slash commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlashCommand {
    Help,
    DebugGroup,
    SendMessage,
}

impl SlashCommand {
    fn name(self) -> &'static str {
        match self {
            SlashCommand::Help => "help",
            SlashCommand::DebugGroup => "debug-group",
            SlashCommand::SendMessage => "send-message",
        }
    }
}

fn parse_slash_command(body: &str) -> Option<SlashCommand> {
    let first_line = body.lines().next().unwrap_or("");
    let token = first_line.split(' ').next().unwrap_or("");
    match token.strip_prefix('/')? {
        "help" => Some(SlashCommand::Help),
        "debug-group" => Some(SlashCommand::DebugGroup),
        "send-message" => Some(SlashCommand::SendMessage),
        _ => None,
    }
}

/// Append a local diagnostic message to a conversation. Never leaves the
/// device.
async fn add_command_message(
    ctx: &Ctx,
    conversation_pk: &PublicKey,
    command: SlashCommand,
    response: &str,
) -> Result<(), CoreError> {
    let index = ctx.handle.select(queries::count).await?;
    let aggregate_id = MessageId::from(format!("cmd_{index}").as_str());
    let now = Utc::now();
    ctx.handle
        .dispatch(MessageEvent::Received {
            aggregate_id: aggregate_id.clone(),
            message: AppMessage::UserMessage {
                body: format!("/{}\n\n{}", command.name(), response),
                attachments: Vec::new(),
                sent_date: now,
            },
            received_date: now,
            is_me: true,
            member_pk: None,
        })
        .await?;
    ctx.handle
        .dispatch(ConversationEvent::MessageAdded {
            id: conversation_pk.clone(),
            message_id: aggregate_id,
            is_me: true,
            last_message_date: now,
        })
        .await
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

async fn tx_send(
    ctx: &Ctx,
    id: &PublicKey,
    body: String,
    attachments: Vec<Attachment>,
) -> Result<(), CoreError> {
    let lookup = id.clone();
    let Some(conversation) = ctx
        .handle
        .select(move |state| conversation::queries::get(state, &lookup).cloned())
        .await?
    else {
        return Ok(());
    };

    if let Some(command) = parse_slash_command(&body) {
        return run_slash_command(ctx, &conversation.pk, command, &body).await;
    }

    let message = AppMessage::UserMessage {
        body,
        attachments,
        sent_date: Utc::now(),
    };
    if let Err(error) = ctx
        .protocol
        .app_message_send(&conversation.pk, message.to_bytes()?)
        .await
    {
        warn!(conversation = %conversation.pk.short(), %error, "failed to send message");
    }
    Ok(())
}

async fn run_slash_command(
    ctx: &Ctx,
    conversation_pk: &PublicKey,
    command: SlashCommand,
    body: &str,
) -> Result<(), CoreError> {
    match command {
        SlashCommand::Help => {
            let response = "/help\t\t\t\t\tShow this command\n\
                            /debug-group\t\t\t\tIndicate 1to1 connection\n\
                            /send-message [message]\tSend message\n";
            add_command_message(ctx, conversation_pk, command, response).await
        }
        SlashCommand::DebugGroup => {
            let reply = match ctx.protocol.debug_group(conversation_pk).await {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(%error, "debug-group failed");
                    return Ok(());
                }
            };
            let response = if reply.peer_ids.is_empty() {
                "You are not connected with this peer ..."
            } else {
                "You are connected with this peer !"
            };
            add_command_message(ctx, conversation_pk, command, response).await
        }
        SlashCommand::SendMessage => {
            // "/send-message " prefix, slash and separating space included.
            let rest = body
                .get(command.name().len() + 2..)
                .unwrap_or("")
                .to_string();
            let response = if rest.is_empty() {
                "Invalid arguments ..."
            } else {
                "You have sent a message !"
            };
            add_command_message(ctx, conversation_pk, command, response).await?;
            if !rest.is_empty() {
                let message = AppMessage::UserMessage {
                    body: rest,
                    attachments: Vec::new(),
                    sent_date: Utc::now(),
                };
                if let Err(error) = ctx
                    .protocol
                    .app_message_send(conversation_pk, message.to_bytes()?)
                    .await
                {
                    warn!(%error, "failed to send message");
                }
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

pub fn slice() -> Result<Slice, ConfigError> {
    Slice::build(SliceDef {
        name: "message",
        effects: vec![
            EffectDef::new(
                "commands",
                |action| matches!(action, Action::Command(Command::Message(_))),
                handle_command,
            ),
            EffectDef::new(
                "group-message",
                |action| matches!(action, Action::Protocol(ProtocolAction::GroupMessage(_))),
                handle_group_message,
            ),
        ],
    })
}

async fn handle_command(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Command(Command::Message(command)) = action else {
        return Ok(());
    };
    match command {
        MessageCommand::Send {
            id,
            body,
            attachments,
        } => tx_send(&ctx, &id, body, attachments).await,
        MessageCommand::Delete { id } => ctx.handle.dispatch(MessageEvent::Deleted { id }).await,
    }
}

async fn handle_group_message(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMessage(envelope)) = action else {
        return Ok(());
    };
    let MessageEnvelope {
        event_context,
        headers,
        message,
    } = envelope;
    let (Some(aggregate_id), Some(group_pk)) = (event_context.id, event_context.group_pk) else {
        return Ok(());
    };
    if message.is_empty() {
        return Ok(());
    }
    let decoded = match AppMessage::from_bytes(&message) {
        Ok(decoded) => decoded,
        Err(error) => {
            warn!(group = %group_pk.short(), %error, "undecodable group message");
            return Ok(());
        }
    };

    let lookup = aggregate_id.clone();
    if ctx
        .handle
        .select(move |state| queries::get(state, &lookup).is_some())
        .await?
    {
        return Ok(());
    }
    let conversation_lookup = group_pk.clone();
    let Some(conversation) = ctx
        .handle
        .select(move |state| conversation::queries::get(state, &conversation_lookup).cloned())
        .await?
    else {
        return Ok(());
    };

    let member_pk = match headers.device_pk.clone() {
        Some(device_pk) => {
            let group_lookup = conversation.pk.clone();
            ctx.handle
                .select(move |state| {
                    groups::queries::member_for_device(state, &group_lookup, &device_pk)
                })
                .await?
        }
        None => None,
    };

    let info = ctx
        .protocol
        .group_info(GroupInfoRequest {
            group_pk: Some(group_pk.clone()),
            contact_pk: None,
        })
        .await?;
    let is_me = match (&headers.device_pk, &info.device_pk) {
        (Some(sender), Some(ours)) => sender == ours,
        _ => false,
    };

    ctx.handle
        .dispatch(MessageEvent::Received {
            aggregate_id: aggregate_id.clone(),
            message: decoded.clone(),
            received_date: Utc::now(),
            is_me,
            member_pk,
        })
        .await?;

    if matches!(
        decoded,
        AppMessage::UserMessage { .. } | AppMessage::GroupInvitation { .. }
    ) {
        ctx.handle
            .dispatch(ConversationEvent::MessageAdded {
                id: group_pk.clone(),
                message_id: aggregate_id.clone(),
                is_me,
                last_message_date: Utc::now(),
            })
            .await?;
    }

    if matches!(decoded, AppMessage::UserMessage { .. }) && !is_me {
        let acknowledge = AppMessage::Acknowledge {
            target: aggregate_id,
        };
        ctx.protocol
            .app_message_send(&group_pk, acknowledge.to_bytes()?)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_message(body: &str) -> AppMessage {
        AppMessage::UserMessage {
            body: body.into(),
            attachments: Vec::new(),
            sent_date: Utc::now(),
        }
    }

    fn received(id: &str, message: AppMessage, is_me: bool) -> MessageEvent {
        MessageEvent::Received {
            aggregate_id: id.into(),
            message,
            received_date: Utc::now(),
            is_me,
            member_pk: None,
        }
    }

    #[test]
    fn received_is_idempotent() {
        let mut state = MessageState::default();
        reduce(&mut state, &received("m1", user_message("hello"), false));
        reduce(&mut state, &received("m1", user_message("changed"), false));
        assert_eq!(state.aggregates.len(), 1);
        match &state.aggregates[&MessageId::from("m1")] {
            Message::UserMessage(m) => assert_eq!(m.body, "hello"),
            other => panic!("unexpected aggregate: {other:?}"),
        }
    }

    #[test]
    fn ack_after_message_flips_acknowledged() {
        let mut state = MessageState::default();
        reduce(&mut state, &received("m1", user_message("hi"), true));
        reduce(
            &mut state,
            &received("a1", AppMessage::Acknowledge { target: "m1".into() }, false),
        );
        match &state.aggregates[&MessageId::from("m1")] {
            Message::UserMessage(m) => assert!(m.acknowledged),
            other => panic!("unexpected aggregate: {other:?}"),
        }
        // The ack itself is never stored.
        assert!(!state.aggregates.contains_key(&MessageId::from("a1")));
    }

    #[test]
    fn ack_before_message_goes_through_backlog() {
        let mut state = MessageState::default();
        reduce(
            &mut state,
            &received("a1", AppMessage::Acknowledge { target: "m1".into() }, false),
        );
        assert!(state.ack_backlog.contains(&MessageId::from("m1")));

        reduce(&mut state, &received("m1", user_message("hi"), true));
        match &state.aggregates[&MessageId::from("m1")] {
            Message::UserMessage(m) => assert!(m.acknowledged),
            other => panic!("unexpected aggregate: {other:?}"),
        }
        assert!(state.ack_backlog.is_empty());
    }

    #[test]
    fn own_acks_are_ignored() {
        let mut state = MessageState::default();
        reduce(&mut state, &received("m1", user_message("hi"), true));
        reduce(
            &mut state,
            &received("a1", AppMessage::Acknowledge { target: "m1".into() }, true),
        );
        match &state.aggregates[&MessageId::from("m1")] {
            Message::UserMessage(m) => assert!(!m.acknowledged),
            other => panic!("unexpected aggregate: {other:?}"),
        }
    }

    #[test]
    fn ack_for_foreign_message_is_dropped() {
        let mut state = MessageState::default();
        reduce(&mut state, &received("m1", user_message("hi"), false));
        reduce(
            &mut state,
            &received("a1", AppMessage::Acknowledge { target: "m1".into() }, false),
        );
        match &state.aggregates[&MessageId::from("m1")] {
            Message::UserMessage(m) => assert!(!m.acknowledged),
            other => panic!("unexpected aggregate: {other:?}"),
        }
    }

    #[test]
    fn slash_commands_are_recognized() {
        assert_eq!(parse_slash_command("/help"), Some(SlashCommand::Help));
        assert_eq!(
            parse_slash_command("/debug-group\nrest"),
            Some(SlashCommand::DebugGroup)
        );
        assert_eq!(
            parse_slash_command("/send-message hello"),
            Some(SlashCommand::SendMessage)
        );
        assert_eq!(parse_slash_command("hello /help"), None);
        assert_eq!(parse_slash_command("/unknown"), None);
    }
}
