//! The projected state tree.
//!
//! One instance lives on the dispatcher task; reducers are its only
//! mutators. Each top-level field maps to a persisted namespace except
//! `client`, which describes the running protocol instance and is rebuilt
//! at every bootstrap.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courrier_shared::message::{Attachment, GroupInvite};
use courrier_shared::types::{MessageId, PublicKey};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppState {
    pub messenger: MessengerState,
    pub settings: SettingsState,
    pub groups: HashMap<PublicKey, GroupRecord>,
    /// Identity of the running protocol instance. Not persisted.
    #[serde(skip)]
    pub client: Option<ClientInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessengerState {
    pub account: Option<Account>,
    pub contact: ContactState,
    pub conversation: ConversationState,
    pub message: MessageState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsState {
    pub node_config: Option<NodeConfig>,
}

/// How the protocol daemon is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeConfig {
    Embedded,
    External { address: String },
}

/// Identity of the running protocol instance, populated at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub account_pk: PublicKey,
    pub account_group_pk: PublicKey,
    pub device_pk: PublicKey,
    pub contact_request_rdv_seed: Option<String>,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub name: String,
    pub onboarded: bool,
    pub deep_link_status: Option<DeepLinkStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeepLinkStatus {
    Done { link: String, kind: DeepLinkKind },
    Failed { link: String, error: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeepLinkKind {
    Contact,
    Group,
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContactState {
    pub entities: HashMap<PublicKey, Contact>,
    pub request_draft: Option<RequestDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: PublicKey,
    pub name: String,
    pub public_key: PublicKey,
    /// The 1:1 group backing this contact, once known.
    pub group_pk: Option<PublicKey>,
    pub fake: bool,
    pub added_date: DateTime<Utc>,
    pub request: ContactRequest,
}

/// Request state machine attached to a contact. `kind` is immutable after
/// creation; `accepted` only ever flips false → true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactRequest {
    pub kind: ContactRequestKind,
    pub accepted: bool,
    pub discarded: bool,
    pub state: RequestState,
    pub sent_date: Option<DateTime<Utc>>,
    /// Event id of the enqueue envelope, when the request went through it.
    pub uid: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContactRequestKind {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RequestState {
    /// Incoming request sighted.
    Received,
    /// Outgoing request resolved locally from a deep link.
    Initiated,
    /// Outgoing request queued by the service.
    Enqueued,
    /// Outgoing request delivered to the peer's rendezvous point.
    Sent,
}

/// Outcome of resolving a contact deep link, displayed by the request UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequestDraft {
    Resolved {
        contact_id: PublicKey,
        contact_name: String,
        contact_rdv_seed: String,
        contact_public_key: PublicKey,
    },
    Failed { error: String },
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Per-group membership record: last known subscription flags, read-cursor
/// marks and the member→devices table. `cids` and `members_devices` only
/// grow; the whole record disappears only with the group itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupRecord {
    pub public_key: PublicKey,
    pub metadata: bool,
    pub messages: bool,
    pub cids: HashSet<String>,
    pub members_devices: HashMap<PublicKey, Vec<PublicKey>>,
}

impl GroupRecord {
    pub fn empty(public_key: PublicKey) -> Self {
        Self {
            public_key,
            metadata: false,
            messages: false,
            cids: HashSet::new(),
            members_devices: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub aggregates: HashMap<PublicKey, Conversation>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationKind {
    OneToOne,
    MultiMember,
    #[serde(rename = "Self")]
    Self_,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: PublicKey,
    pub pk: PublicKey,
    pub kind: ConversationKind,
    pub title: String,
    /// Paired contact, OneToOne only.
    pub contact_id: Option<PublicKey>,
    pub fake: bool,
    pub shareable_group: Option<String>,
    pub created_at: DateTime<Utc>,
    pub members: Vec<PublicKey>,
    /// Message ids in arrival order of the underlying stream.
    pub messages: Vec<MessageId>,
    /// Display names announced per member; first write wins.
    pub members_names: HashMap<PublicKey, String>,
    pub unread_count: u32,
    pub reading: bool,
    pub last_message_date: Option<DateTime<Utc>>,
    pub last_sent_message: Option<MessageId>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageState {
    pub aggregates: HashMap<MessageId, Message>,
    /// Acknowledgements whose target message has not been projected yet.
    pub ack_backlog: HashSet<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    UserMessage(UserMessage),
    GroupInvitation(InvitationMessage),
}

impl Message {
    pub fn id(&self) -> &MessageId {
        match self {
            Message::UserMessage(m) => &m.id,
            Message::GroupInvitation(m) => &m.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: MessageId,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub sent_date: DateTime<Utc>,
    pub received_date: DateTime<Utc>,
    pub acknowledged: bool,
    pub is_me: bool,
    pub member_pk: Option<PublicKey>,
    pub fake: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvitationMessage {
    pub id: MessageId,
    pub name: String,
    pub group: GroupInvite,
    pub is_me: bool,
    pub received_date: DateTime<Utc>,
    pub fake: bool,
}
