//! In-memory stand-ins for the protocol service and the native bridge.
//!
//! [`FakeProtocol`] keeps every unary call in a log, lets tests wire
//! contact→group resolutions, and exposes `emit_*` methods to inject events
//! into whatever streams the core subscribed. Subscriptions are backed by
//! unbounded channels; a dropped stream (canceled listener task) is pruned
//! on the next emit, which is what the `open_*_streams` counters observe.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use courrier_shared::deeplink::{DeepLink, GroupLink};
use courrier_shared::message::GroupInvite;
use courrier_shared::types::{GroupType, PublicKey};

use crate::bridge::{BridgeConfig, BridgeError, NativeBridge};
use crate::error::RemoteError;
use crate::service::{EventStream, ProtocolService};
use crate::types::{
    ContactRequestReferenceReply, ContactRequestSendRequest, DebugGroupReply, GroupInfoReply,
    GroupInfoRequest, GroupSummary, InstanceConfiguration, InvitationCreateReply,
    MessageEnvelope, MetadataEnvelope, MultiMemberGroupCreateReply, ShareableLinkReply,
};

type Listeners<T> = HashMap<PublicKey, Vec<mpsc::UnboundedSender<Result<T, RemoteError>>>>;

struct Inner {
    config: InstanceConfiguration,
    rdv_seed: String,
    /// contact pk → its 1:1 group pk, as `group_info` would resolve it.
    contact_groups: HashMap<PublicKey, PublicKey>,
    active_groups: HashSet<PublicKey>,
    metadata_listeners: Listeners<MetadataEnvelope>,
    message_listeners: Listeners<MessageEnvelope>,
    sent_messages: Vec<(PublicKey, Vec<u8>)>,
    sent_metadata: Vec<(PublicKey, Vec<u8>)>,
    peers: HashMap<PublicKey, Vec<String>>,
    calls: Vec<String>,
    group_counter: u32,
}

pub struct FakeProtocol {
    inner: Mutex<Inner>,
}

impl FakeProtocol {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                config: InstanceConfiguration {
                    account_pk: PublicKey::from("fake-account-pk"),
                    account_group_pk: PublicKey::from("fake-account-group-pk"),
                    device_pk: PublicKey::from("fake-device-pk"),
                },
                rdv_seed: "fake-rdv-seed".to_string(),
                contact_groups: HashMap::new(),
                active_groups: HashSet::new(),
                metadata_listeners: HashMap::new(),
                message_listeners: HashMap::new(),
                sent_messages: Vec::new(),
                sent_metadata: Vec::new(),
                peers: HashMap::new(),
                calls: Vec::new(),
                group_counter: 0,
            }),
        }
    }

    pub fn configuration(&self) -> InstanceConfiguration {
        self.inner.lock().unwrap().config.clone()
    }

    /// Teach `group_info` to resolve a contact to its 1:1 group.
    pub fn set_contact_group(&self, contact_pk: PublicKey, group_pk: PublicKey) {
        let mut inner = self.inner.lock().unwrap();
        inner.contact_groups.insert(contact_pk, group_pk);
    }

    pub fn set_peers(&self, group_pk: PublicKey, peers: Vec<String>) {
        self.inner.lock().unwrap().peers.insert(group_pk, peers);
    }

    /// Push a metadata event to every live subscriber of `group_pk`.
    pub fn emit_metadata(&self, group_pk: &PublicKey, envelope: MetadataEnvelope) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listeners) = inner.metadata_listeners.get_mut(group_pk) {
            listeners.retain(|tx| tx.send(Ok(envelope.clone())).is_ok());
        }
    }

    /// Push a message event to every live subscriber of `group_pk`.
    pub fn emit_message(&self, group_pk: &PublicKey, envelope: MessageEnvelope) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listeners) = inner.message_listeners.get_mut(group_pk) {
            listeners.retain(|tx| tx.send(Ok(envelope.clone())).is_ok());
        }
    }

    /// Number of live message subscriptions for a group (canceled listener
    /// tasks drop their stream half, which closes the channel).
    pub fn open_message_streams(&self, group_pk: &PublicKey) -> usize {
        let mut inner = self.inner.lock().unwrap();
        match inner.message_listeners.get_mut(group_pk) {
            Some(listeners) => {
                listeners.retain(|tx| !tx.is_closed());
                listeners.len()
            }
            None => 0,
        }
    }

    pub fn open_metadata_streams(&self, group_pk: &PublicKey) -> usize {
        let mut inner = self.inner.lock().unwrap();
        match inner.metadata_listeners.get_mut(group_pk) {
            Some(listeners) => {
                listeners.retain(|tx| !tx.is_closed());
                listeners.len()
            }
            None => 0,
        }
    }

    /// Payloads handed to `app_message_send`, in call order.
    pub fn sent_messages(&self) -> Vec<(PublicKey, Vec<u8>)> {
        self.inner.lock().unwrap().sent_messages.clone()
    }

    pub fn sent_metadata(&self) -> Vec<(PublicKey, Vec<u8>)> {
        self.inner.lock().unwrap().sent_metadata.clone()
    }

    /// Log of every unary call, formatted `method:arg`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }

    fn stream_for<T: Send + 'static>(
        listeners: &mut Listeners<T>,
        group_pk: &PublicKey,
    ) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.entry(group_pk.clone()).or_default().push(tx);
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

impl Default for FakeProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolService for FakeProtocol {
    async fn instance_get_configuration(&self) -> Result<InstanceConfiguration, RemoteError> {
        self.record("instance_get_configuration".to_string());
        Ok(self.inner.lock().unwrap().config.clone())
    }

    async fn instance_shareable_id(
        &self,
        reset: bool,
        display_name: &str,
    ) -> Result<ShareableLinkReply, RemoteError> {
        self.record(format!("instance_shareable_id:{reset}:{display_name}"));
        let inner = self.inner.lock().unwrap();
        let link = DeepLink::Id(courrier_shared::deeplink::IdLink {
            account_pk: inner.config.account_pk.clone(),
            public_rendezvous_seed: inner.rdv_seed.clone(),
            display_name: Some(display_name.to_string()),
        });
        Ok(ShareableLinkReply {
            deep_link: link.encode(),
        })
    }

    async fn group_info(&self, request: GroupInfoRequest) -> Result<GroupInfoReply, RemoteError> {
        let inner = self.inner.lock().unwrap();
        if let Some(contact_pk) = &request.contact_pk {
            let group_pk = inner
                .contact_groups
                .get(contact_pk)
                .cloned()
                .ok_or_else(|| RemoteError::not_found("no group for contact"))?;
            return Ok(GroupInfoReply {
                group: Some(GroupSummary {
                    public_key: group_pk,
                    group_type: GroupType::Contact,
                }),
                member_pk: Some(inner.config.account_pk.clone()),
                device_pk: Some(inner.config.device_pk.clone()),
            });
        }
        if let Some(group_pk) = &request.group_pk {
            return Ok(GroupInfoReply {
                group: Some(GroupSummary {
                    public_key: group_pk.clone(),
                    group_type: GroupType::MultiMember,
                }),
                member_pk: Some(inner.config.account_pk.clone()),
                device_pk: Some(inner.config.device_pk.clone()),
            });
        }
        Err(RemoteError::invalid_argument("empty group_info request"))
    }

    async fn contact_request_reference(
        &self,
    ) -> Result<ContactRequestReferenceReply, RemoteError> {
        self.record("contact_request_reference".to_string());
        Ok(ContactRequestReferenceReply {
            public_rendezvous_seed: self.inner.lock().unwrap().rdv_seed.clone(),
            enabled: true,
        })
    }

    async fn contact_request_send(
        &self,
        request: ContactRequestSendRequest,
    ) -> Result<(), RemoteError> {
        self.record(format!("contact_request_send:{}", request.contact.pk));
        Ok(())
    }

    async fn contact_request_accept(&self, contact_pk: &PublicKey) -> Result<(), RemoteError> {
        self.record(format!("contact_request_accept:{contact_pk}"));
        Ok(())
    }

    async fn contact_block(&self, contact_pk: &PublicKey) -> Result<(), RemoteError> {
        self.record(format!("contact_block:{contact_pk}"));
        Ok(())
    }

    async fn contact_unblock(&self, contact_pk: &PublicKey) -> Result<(), RemoteError> {
        self.record(format!("contact_unblock:{contact_pk}"));
        Ok(())
    }

    async fn app_message_send(
        &self,
        group_pk: &PublicKey,
        payload: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.record(format!("app_message_send:{group_pk}"));
        self.inner
            .lock()
            .unwrap()
            .sent_messages
            .push((group_pk.clone(), payload));
        Ok(())
    }

    async fn app_metadata_send(
        &self,
        group_pk: &PublicKey,
        payload: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.record(format!("app_metadata_send:{group_pk}"));
        self.inner
            .lock()
            .unwrap()
            .sent_metadata
            .push((group_pk.clone(), payload));
        Ok(())
    }

    async fn multi_member_group_create(
        &self,
    ) -> Result<MultiMemberGroupCreateReply, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.group_counter += 1;
        let group_pk = PublicKey::from_string(format!("mm-group-{}", inner.group_counter));
        inner.calls.push(format!("multi_member_group_create:{group_pk}"));
        Ok(MultiMemberGroupCreateReply { group_pk })
    }

    async fn multi_member_group_invitation_create(
        &self,
        group_pk: &PublicKey,
    ) -> Result<InvitationCreateReply, RemoteError> {
        self.record(format!("multi_member_group_invitation_create:{group_pk}"));
        Ok(InvitationCreateReply {
            group: Some(GroupInvite {
                public_key: group_pk.clone(),
                secret: "fake-secret".to_string(),
                secret_sig: "fake-secret-sig".to_string(),
                group_type: GroupType::MultiMember,
            }),
        })
    }

    async fn multi_member_group_join(&self, group: GroupInvite) -> Result<(), RemoteError> {
        self.record(format!("multi_member_group_join:{}", group.public_key));
        Ok(())
    }

    async fn parse_deep_link(&self, link: &str) -> Result<DeepLink, RemoteError> {
        self.record("parse_deep_link".to_string());
        DeepLink::decode(link).map_err(|e| RemoteError::invalid_argument(e.to_string()))
    }

    async fn shareable_group(
        &self,
        group_pk: &PublicKey,
        group_name: &str,
    ) -> Result<ShareableLinkReply, RemoteError> {
        self.record(format!("shareable_group:{group_pk}"));
        let link = DeepLink::Group(GroupLink {
            group: GroupInvite {
                public_key: group_pk.clone(),
                secret: "fake-secret".to_string(),
                secret_sig: "fake-secret-sig".to_string(),
                group_type: GroupType::MultiMember,
            },
            display_name: group_name.to_string(),
        });
        Ok(ShareableLinkReply {
            deep_link: link.encode(),
        })
    }

    async fn activate_group(&self, group_pk: &PublicKey) -> Result<(), RemoteError> {
        self.record(format!("activate_group:{group_pk}"));
        self.inner
            .lock()
            .unwrap()
            .active_groups
            .insert(group_pk.clone());
        Ok(())
    }

    async fn debug_group(&self, group_pk: &PublicKey) -> Result<DebugGroupReply, RemoteError> {
        self.record(format!("debug_group:{group_pk}"));
        Ok(DebugGroupReply {
            peer_ids: self
                .inner
                .lock()
                .unwrap()
                .peers
                .get(group_pk)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn subscribe_group_metadata(
        &self,
        group_pk: &PublicKey,
    ) -> Result<EventStream<MetadataEnvelope>, RemoteError> {
        self.record(format!("subscribe_group_metadata:{group_pk}"));
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::stream_for(&mut inner.metadata_listeners, group_pk))
    }

    async fn subscribe_group_messages(
        &self,
        group_pk: &PublicKey,
    ) -> Result<EventStream<MessageEnvelope>, RemoteError> {
        self.record(format!("subscribe_group_messages:{group_pk}"));
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::stream_for(&mut inner.message_listeners, group_pk))
    }
}

/// Records bridge lifecycle calls.
#[derive(Default)]
pub struct FakeBridge {
    calls: Mutex<Vec<String>>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NativeBridge for FakeBridge {
    async fn start(&self, config: BridgeConfig) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().push(format!("start:{}", config.name));
        Ok(())
    }

    async fn stop(&self) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().push("stop".to_string());
        Ok(())
    }

    async fn clear_storage(&self) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().push("clear_storage".to_string());
        Ok(())
    }
}
