//! Application-level message payloads.
//!
//! These are the JSON payloads carried opaquely by the protocol service
//! inside group messages (`UserMessage`, `Acknowledge`, `GroupInvitation`)
//! and group metadata (`SetGroupName`, `SetUserName`). The projection core
//! decodes them from event envelopes and encodes them for outbound sends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GroupType, MessageId, PublicKey};

/// A reference to a multi-member group, complete enough to join it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupInvite {
    pub public_key: PublicKey,
    pub secret: String,
    pub secret_sig: String,
    pub group_type: GroupType,
}

/// An attachment reference on a user message. Content transfer is handled
/// out of band; the projection only keeps the reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub uri: String,
}

/// All payload variants exchanged at the application level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AppMessage {
    /// A plain chat message.
    #[serde(rename_all = "camelCase")]
    UserMessage {
        body: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        sent_date: DateTime<Utc>,
    },

    /// Acknowledgement of a previously received user message.
    ///
    /// Never stored as an aggregate of its own; it either flips the target
    /// message's `acknowledged` flag or lands in the ack backlog when the
    /// target has not been projected yet.
    #[serde(rename_all = "camelCase")]
    Acknowledge { target: MessageId },

    /// Invitation to a multi-member group, sent over an established 1:1.
    #[serde(rename_all = "camelCase")]
    GroupInvitation { name: String, group: GroupInvite },

    /// Group metadata: renames the group for every member.
    #[serde(rename_all = "camelCase")]
    SetGroupName { name: String },

    /// Group metadata: announces a member's display name.
    #[serde(rename_all = "camelCase")]
    SetUserName {
        user_name: String,
        member_pk: PublicKey,
    },
}

impl AppMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_round_trip() {
        let msg = AppMessage::UserMessage {
            body: "salut".to_string(),
            attachments: vec![],
            sent_date: Utc::now(),
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = AppMessage::from_bytes(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn acknowledge_is_tagged_by_type() {
        let msg = AppMessage::Acknowledge {
            target: MessageId::from("abcd"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "acknowledge");
        assert_eq!(json["target"], "abcd");
    }

    #[test]
    fn missing_attachments_default_to_empty() {
        let json = r#"{"type":"userMessage","body":"hi","sentDate":"2024-03-01T10:00:00Z"}"#;
        let decoded = AppMessage::from_bytes(json.as_bytes()).unwrap();
        match decoded {
            AppMessage::UserMessage { attachments, .. } => assert!(attachments.is_empty()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
