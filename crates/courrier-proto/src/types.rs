//! Decoded event envelopes and unary request/reply types.

use serde::{Deserialize, Serialize};

use courrier_shared::message::GroupInvite;
use courrier_shared::types::{GroupType, MessageId, PublicKey};

/// Ordering context attached to every event of a subscribed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Stream-unique event id; becomes the message aggregate id for
    /// group-message events.
    pub id: Option<MessageId>,
    /// Group the event belongs to.
    pub group_pk: Option<PublicKey>,
}

/// Headers of a group-message envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Device that authored the message.
    pub device_pk: Option<PublicKey>,
}

/// One event of a group-message subscription. The payload is an opaque
/// application message, decoded by the message slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub event_context: EventContext,
    pub headers: MessageHeaders,
    pub message: Vec<u8>,
}

/// One event of a group-metadata subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEnvelope {
    pub event_context: EventContext,
    pub event: MetadataEvent,
}

/// Metadata events the projection reacts to. Account-level contact-request
/// lifecycle events arrive on the account group's metadata stream; the
/// per-group events arrive on the streams of the groups they concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataEvent {
    ContactRequestOutgoingEnqueued { contact: ContactRef },
    ContactRequestOutgoingSent { contact_pk: PublicKey },
    ContactRequestIncomingReceived {
        contact_pk: PublicKey,
        contact_metadata: Vec<u8>,
    },
    ContactRequestIncomingAccepted {
        contact_pk: PublicKey,
        group_pk: Option<PublicKey>,
    },
    ContactRequestIncomingDiscarded { contact_pk: PublicKey },
    ContactBlocked { contact_pk: PublicKey },
    GroupJoined { group: GroupInvite },
    MemberDeviceAdded {
        member_pk: PublicKey,
        device_pk: PublicKey,
    },
    /// An application metadata payload (SetGroupName / SetUserName), opaque
    /// at this layer.
    MetadataPayloadSent { payload: Vec<u8> },
}

/// Reference to a contact inside a request, as the service transmits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRef {
    pub pk: PublicKey,
    pub public_rendezvous_seed: String,
    /// Opaque JSON metadata ([`ContactMetadata`] once decoded).
    pub metadata: Vec<u8>,
}

/// JSON metadata attached to contact requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfoRequest {
    pub group_pk: Option<PublicKey>,
    pub contact_pk: Option<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub public_key: PublicKey,
    pub group_type: GroupType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfoReply {
    pub group: Option<GroupSummary>,
    /// Our member key inside the group.
    pub member_pk: Option<PublicKey>,
    /// Our device key inside the group.
    pub device_pk: Option<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRequestSendRequest {
    pub contact: ContactRef,
    pub own_metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRequestReferenceReply {
    pub public_rendezvous_seed: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiMemberGroupCreateReply {
    pub group_pk: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationCreateReply {
    pub group: Option<GroupInvite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareableLinkReply {
    pub deep_link: String,
}

/// Identity of the running protocol instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfiguration {
    pub account_pk: PublicKey,
    pub account_group_pk: PublicKey,
    pub device_pk: PublicKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugGroupReply {
    pub peer_ids: Vec<String>,
}
