//! Groups slice: subscription lifecycle of per-group event streams.
//!
//! The `open` handler owns the task table mapping each group to its running
//! listener tasks. Subscription flags are projected into [`GroupRecord`]s so
//! a restart can re-open the same streams.

use std::collections::HashMap;

use futures::StreamExt;

use courrier_proto::types::MetadataEvent;
use courrier_shared::types::PublicKey;

use crate::action::{Action, Command, Control, ProtocolAction};
use crate::error::{ConfigError, CoreError};
use crate::slice::{Ctx, EffectDef, Slice, SliceDef, TaskHandle};
use crate::state::{AppState, GroupRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub public_key: PublicKey,
    pub metadata: bool,
    pub messages: bool,
}

#[derive(Debug, Clone)]
pub enum GroupsCommand {
    /// Start the subscription orchestration; re-opens persisted streams.
    Open,
    Subscribe(SubscribeOptions),
    Unsubscribe(SubscribeOptions),
}

#[derive(Debug, Clone)]
pub enum GroupsEvent {
    /// Subscription flags changed; carries the flags now in effect.
    Updated(SubscribeOptions),
    CidRead {
        public_key: PublicKey,
        cid: String,
    },
    MemberDeviceAdded {
        group_pk: PublicKey,
        member_pk: PublicKey,
        device_pk: PublicKey,
    },
    Opened,
    Stopped,
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

pub(crate) fn reduce(groups: &mut HashMap<PublicKey, GroupRecord>, event: &GroupsEvent) {
    match event {
        GroupsEvent::Updated(opts) => {
            let group = groups
                .entry(opts.public_key.clone())
                .or_insert_with(|| GroupRecord::empty(opts.public_key.clone()));
            group.metadata = opts.metadata;
            group.messages = opts.messages;
        }
        GroupsEvent::CidRead { public_key, cid } => {
            groups
                .entry(public_key.clone())
                .or_insert_with(|| GroupRecord::empty(public_key.clone()))
                .cids
                .insert(cid.clone());
        }
        GroupsEvent::MemberDeviceAdded {
            group_pk,
            member_pk,
            device_pk,
        } => {
            let devices = groups
                .entry(group_pk.clone())
                .or_insert_with(|| GroupRecord::empty(group_pk.clone()))
                .members_devices
                .entry(member_pk.clone())
                .or_default();
            if !devices.contains(device_pk) {
                devices.push(device_pk.clone());
            }
        }
        GroupsEvent::Opened | GroupsEvent::Stopped => {}
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub mod queries {
    use super::*;

    pub fn get<'a>(state: &'a AppState, group_pk: &PublicKey) -> Option<&'a GroupRecord> {
        state.groups.get(group_pk)
    }

    pub fn is_cid_read(state: &AppState, group_pk: &PublicKey, cid: &str) -> bool {
        get(state, group_pk).map_or(false, |g| g.cids.contains(cid))
    }

    /// Resolve the member that owns a device inside a group.
    pub fn member_for_device(
        state: &AppState,
        group_pk: &PublicKey,
        device_pk: &PublicKey,
    ) -> Option<PublicKey> {
        let group = get(state, group_pk)?;
        group
            .members_devices
            .iter()
            .find(|(_, devices)| devices.contains(device_pk))
            .map(|(member_pk, _)| member_pk.clone())
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

pub fn slice() -> Result<Slice, ConfigError> {
    Slice::build(SliceDef {
        name: "groups",
        effects: vec![
            EffectDef::new(
                "open",
                |action| {
                    matches!(
                        action,
                        Action::Command(Command::Groups(GroupsCommand::Open))
                    )
                },
                |ctx, _| handle_open(ctx),
            ),
            EffectDef::new(
                "member-device-added",
                |action| {
                    matches!(
                        action,
                        Action::Protocol(ProtocolAction::GroupMetadata(envelope))
                            if matches!(envelope.event, MetadataEvent::MemberDeviceAdded { .. })
                    )
                },
                handle_member_device_added,
            ),
        ],
    })
}

#[derive(Default)]
struct GroupTasks {
    messages: Option<TaskHandle>,
    metadata: Option<TaskHandle>,
}

async fn handle_open(ctx: Ctx) -> Result<(), CoreError> {
    let mut tasks: HashMap<PublicKey, GroupTasks> = HashMap::new();

    // Subscribe before reading persisted flags so no command slips past
    // between re-opening the streams and entering the loop.
    let rx = ctx.handle.subscribe();

    let persisted: Vec<SubscribeOptions> = ctx
        .handle
        .select(|state| {
            state
                .groups
                .values()
                .map(|g| SubscribeOptions {
                    public_key: g.public_key.clone(),
                    metadata: g.metadata,
                    messages: g.messages,
                })
                .collect()
        })
        .await?;

    for opts in persisted {
        if !opts.metadata && !opts.messages {
            continue;
        }
        ctx.protocol.activate_group(&opts.public_key).await?;
        let entry = tasks.entry(opts.public_key.clone()).or_default();
        if opts.messages {
            entry.messages = Some(fork_messages_listener(&ctx, opts.public_key.clone()));
        }
        if opts.metadata {
            entry.metadata = Some(fork_metadata_listener(&ctx, opts.public_key.clone()));
        }
    }

    ctx.handle.dispatch(GroupsEvent::Opened).await?;

    let mut rx = rx;
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                stop_all(&mut tasks);
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
                match action {
                    Action::Command(Command::Groups(GroupsCommand::Subscribe(opts))) => {
                        let entry = tasks.entry(opts.public_key.clone()).or_default();
                        if opts.messages && entry.messages.is_none() {
                            entry.messages =
                                Some(fork_messages_listener(&ctx, opts.public_key.clone()));
                        }
                        if opts.metadata && entry.metadata.is_none() {
                            entry.metadata =
                                Some(fork_metadata_listener(&ctx, opts.public_key.clone()));
                        }
                        let updated = SubscribeOptions {
                            public_key: opts.public_key,
                            metadata: entry.metadata.is_some(),
                            messages: entry.messages.is_some(),
                        };
                        ctx.handle.dispatch(GroupsEvent::Updated(updated)).await?;
                    }
                    Action::Command(Command::Groups(GroupsCommand::Unsubscribe(opts))) => {
                        // Never-subscribed groups have no entry; don't create one.
                        let Some(entry) = tasks.get_mut(&opts.public_key) else {
                            continue;
                        };
                        if opts.messages {
                            if let Some(task) = entry.messages.take() {
                                task.cancel();
                            }
                        }
                        if opts.metadata {
                            if let Some(task) = entry.metadata.take() {
                                task.cancel();
                            }
                        }
                        let updated = SubscribeOptions {
                            public_key: opts.public_key,
                            metadata: entry.metadata.is_some(),
                            messages: entry.messages.is_some(),
                        };
                        ctx.handle.dispatch(GroupsEvent::Updated(updated)).await?;
                    }
                    Action::Control(Control::StopClient) => {
                        stop_all(&mut tasks);
                        ctx.handle.dispatch(GroupsEvent::Stopped).await?;
                    }
                    _ => {}
                }
            }
        }
    }
}

fn stop_all(tasks: &mut HashMap<PublicKey, GroupTasks>) {
    for (_, group) in tasks.drain() {
        if let Some(task) = group.messages {
            task.cancel();
        }
        if let Some(task) = group.metadata {
            task.cancel();
        }
    }
}

fn fork_messages_listener(ctx: &Ctx, group_pk: PublicKey) -> TaskHandle {
    ctx.fork("group-messages", move |ctx| {
        listen_to_group_messages(ctx, group_pk)
    })
}

fn fork_metadata_listener(ctx: &Ctx, group_pk: PublicKey) -> TaskHandle {
    ctx.fork("group-metadata", move |ctx| {
        listen_to_group_metadata(ctx, group_pk)
    })
}

async fn listen_to_group_messages(ctx: Ctx, group_pk: PublicKey) -> Result<(), CoreError> {
    let mut stream = ctx.protocol.subscribe_group_messages(&group_pk).await?;
    tracing::debug!(group = %group_pk.short(), "message stream opened");
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(envelope)) => {
                    ctx.handle
                        .dispatch(ProtocolAction::GroupMessage(envelope))
                        .await?;
                }
                Some(Err(error)) => return Err(error.into()),
                None => return Ok(()),
            }
        }
    }
}

async fn listen_to_group_metadata(ctx: Ctx, group_pk: PublicKey) -> Result<(), CoreError> {
    let mut stream = ctx.protocol.subscribe_group_metadata(&group_pk).await?;
    tracing::debug!(group = %group_pk.short(), "metadata stream opened");
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(envelope)) => {
                    ctx.handle
                        .dispatch(ProtocolAction::GroupMetadata(envelope))
                        .await?;
                }
                Some(Err(error)) => return Err(error.into()),
                None => return Ok(()),
            }
        }
    }
}

async fn handle_member_device_added(ctx: Ctx, action: Action) -> Result<(), CoreError> {
    let Action::Protocol(ProtocolAction::GroupMetadata(envelope)) = action else {
        return Ok(());
    };
    let MetadataEvent::MemberDeviceAdded {
        member_pk,
        device_pk,
    } = envelope.event
    else {
        return Ok(());
    };
    let Some(group_pk) = envelope.event_context.group_pk else {
        return Ok(());
    };
    ctx.handle
        .dispatch(GroupsEvent::MemberDeviceAdded {
            group_pk,
            member_pk,
            device_pk,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(s: &str) -> PublicKey {
        PublicKey::from(s)
    }

    #[test]
    fn updated_creates_then_patches_flags() {
        let mut groups = HashMap::new();
        reduce(
            &mut groups,
            &GroupsEvent::Updated(SubscribeOptions {
                public_key: pk("g1"),
                metadata: true,
                messages: false,
            }),
        );
        assert!(groups[&pk("g1")].metadata);
        assert!(!groups[&pk("g1")].messages);

        reduce(
            &mut groups,
            &GroupsEvent::Updated(SubscribeOptions {
                public_key: pk("g1"),
                metadata: true,
                messages: true,
            }),
        );
        assert!(groups[&pk("g1")].messages);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn member_devices_are_deduplicated() {
        let mut groups = HashMap::new();
        let event = GroupsEvent::MemberDeviceAdded {
            group_pk: pk("g1"),
            member_pk: pk("m1"),
            device_pk: pk("d1"),
        };
        reduce(&mut groups, &event);
        reduce(&mut groups, &event);
        reduce(
            &mut groups,
            &GroupsEvent::MemberDeviceAdded {
                group_pk: pk("g1"),
                member_pk: pk("m1"),
                device_pk: pk("d2"),
            },
        );
        assert_eq!(
            groups[&pk("g1")].members_devices[&pk("m1")],
            vec![pk("d1"), pk("d2")]
        );
    }

    #[test]
    fn cid_read_is_sticky() {
        let mut groups = HashMap::new();
        reduce(
            &mut groups,
            &GroupsEvent::CidRead {
                public_key: pk("g1"),
                cid: "cid-1".into(),
            },
        );
        let state = AppState {
            groups,
            ..Default::default()
        };
        assert!(queries::is_cid_read(&state, &pk("g1"), "cid-1"));
        assert!(!queries::is_cid_read(&state, &pk("g1"), "cid-2"));
        assert!(!queries::is_cid_read(&state, &pk("g2"), "cid-1"));
    }

    #[test]
    fn member_for_device_resolves_owner() {
        let mut groups = HashMap::new();
        reduce(
            &mut groups,
            &GroupsEvent::MemberDeviceAdded {
                group_pk: pk("g1"),
                member_pk: pk("m1"),
                device_pk: pk("d1"),
            },
        );
        let state = AppState {
            groups,
            ..Default::default()
        };
        assert_eq!(
            queries::member_for_device(&state, &pk("g1"), &pk("d1")),
            Some(pk("m1"))
        );
        assert_eq!(queries::member_for_device(&state, &pk("g1"), &pk("dX")), None);
    }
}
