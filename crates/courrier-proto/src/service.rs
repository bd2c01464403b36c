//! The remote protocol service seen as an opaque transport.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use courrier_shared::deeplink::DeepLink;
use courrier_shared::message::GroupInvite;
use courrier_shared::types::PublicKey;

use crate::error::RemoteError;
use crate::types::{
    ContactRequestReferenceReply, ContactRequestSendRequest, DebugGroupReply, GroupInfoReply,
    GroupInfoRequest, InstanceConfiguration, InvitationCreateReply, MessageEnvelope,
    MetadataEnvelope, MultiMemberGroupCreateReply, ShareableLinkReply,
};

/// A lazy, infinite, cancelable sequence of decoded event envelopes.
///
/// Delivery within one stream is strictly ordered; ordering across streams
/// is not guaranteed. Dropping the stream releases the subscription.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<T, RemoteError>> + Send>>;

/// Unary calls and subscription streams exposed by the protocol daemon.
///
/// Every unary call may fail with a [`RemoteError`] carrying the service's
/// status code, distinct from the core's local validation errors.
#[async_trait]
pub trait ProtocolService: Send + Sync {
    async fn instance_get_configuration(&self) -> Result<InstanceConfiguration, RemoteError>;

    /// Compute a shareable identity link, optionally rotating the rendezvous
    /// seed first.
    async fn instance_shareable_id(
        &self,
        reset: bool,
        display_name: &str,
    ) -> Result<ShareableLinkReply, RemoteError>;

    /// Resolve the group backing a contact (1:1) or describe a group.
    async fn group_info(&self, request: GroupInfoRequest) -> Result<GroupInfoReply, RemoteError>;

    async fn contact_request_reference(&self)
        -> Result<ContactRequestReferenceReply, RemoteError>;

    async fn contact_request_send(
        &self,
        request: ContactRequestSendRequest,
    ) -> Result<(), RemoteError>;

    async fn contact_request_accept(&self, contact_pk: &PublicKey) -> Result<(), RemoteError>;

    async fn contact_block(&self, contact_pk: &PublicKey) -> Result<(), RemoteError>;

    async fn contact_unblock(&self, contact_pk: &PublicKey) -> Result<(), RemoteError>;

    async fn app_message_send(
        &self,
        group_pk: &PublicKey,
        payload: Vec<u8>,
    ) -> Result<(), RemoteError>;

    async fn app_metadata_send(
        &self,
        group_pk: &PublicKey,
        payload: Vec<u8>,
    ) -> Result<(), RemoteError>;

    async fn multi_member_group_create(&self)
        -> Result<MultiMemberGroupCreateReply, RemoteError>;

    async fn multi_member_group_invitation_create(
        &self,
        group_pk: &PublicKey,
    ) -> Result<InvitationCreateReply, RemoteError>;

    async fn multi_member_group_join(&self, group: GroupInvite) -> Result<(), RemoteError>;

    async fn parse_deep_link(&self, link: &str) -> Result<DeepLink, RemoteError>;

    async fn shareable_group(
        &self,
        group_pk: &PublicKey,
        group_name: &str,
    ) -> Result<ShareableLinkReply, RemoteError>;

    /// Mark a group active on the service side so its streams produce events.
    async fn activate_group(&self, group_pk: &PublicKey) -> Result<(), RemoteError>;

    async fn debug_group(&self, group_pk: &PublicKey) -> Result<DebugGroupReply, RemoteError>;

    async fn subscribe_group_metadata(
        &self,
        group_pk: &PublicKey,
    ) -> Result<EventStream<MetadataEnvelope>, RemoteError>;

    async fn subscribe_group_messages(
        &self,
        group_pk: &PublicKey,
    ) -> Result<EventStream<MessageEnvelope>, RemoteError>;
}
