//! Deep-link payloads and their string codec.
//!
//! A deep link is `courrier://id/#<payload>` or `courrier://group/#<payload>`
//! where the payload is base64url-encoded JSON. Parsing links received from
//! the outside world goes through the protocol service (`parse_deep_link`);
//! this module provides the payload types shared with it and the encoder
//! used when computing shareable links.

use serde::{Deserialize, Serialize};

use crate::constants::DEEP_LINK_SCHEME;
use crate::message::GroupInvite;
use crate::types::PublicKey;

/// Identity payload of a contact deep link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdLink {
    pub account_pk: PublicKey,
    pub public_rendezvous_seed: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Group payload of a multi-member group deep link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupLink {
    pub group: GroupInvite,
    pub display_name: String,
}

/// A decoded deep link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepLink {
    Id(IdLink),
    Group(GroupLink),
}

impl DeepLink {
    /// Encode as a shareable link string.
    pub fn encode(&self) -> String {
        let (kind, json) = match self {
            DeepLink::Id(payload) => ("id", serde_json::to_vec(payload)),
            DeepLink::Group(payload) => ("group", serde_json::to_vec(payload)),
        };
        let json = json.expect("deep link payload serialization");
        format!("{DEEP_LINK_SCHEME}{kind}/#{}", base64_url_encode(&json))
    }

    /// Decode a link string back into its payload.
    pub fn decode(link: &str) -> Result<Self, DeepLinkError> {
        let rest = link
            .strip_prefix(DEEP_LINK_SCHEME)
            .ok_or(DeepLinkError::InvalidScheme)?;
        let (kind, payload) = rest.split_once("/#").ok_or(DeepLinkError::InvalidFormat)?;
        let bytes = base64_url_decode(payload)?;
        match kind {
            "id" => serde_json::from_slice(&bytes)
                .map(DeepLink::Id)
                .map_err(|_| DeepLinkError::InvalidPayload),
            "group" => serde_json::from_slice(&bytes)
                .map(DeepLink::Group)
                .map_err(|_| DeepLinkError::InvalidPayload),
            _ => Err(DeepLinkError::UnknownKind),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeepLinkError {
    #[error("Link does not start with the courrier scheme")]
    InvalidScheme,

    #[error("Malformed link")]
    InvalidFormat,

    #[error("Unknown link kind")]
    UnknownKind,

    #[error("Invalid link payload")]
    InvalidPayload,

    #[error("Base64 decode error")]
    Base64Decode,
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(data)
}

fn base64_url_decode(s: &str) -> Result<Vec<u8>, DeepLinkError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD
        .decode(s.trim())
        .map_err(|_| DeepLinkError::Base64Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupType;

    #[test]
    fn id_link_round_trip() {
        let link = DeepLink::Id(IdLink {
            account_pk: PublicKey::from("aa11"),
            public_rendezvous_seed: "seed".to_string(),
            display_name: Some("alice".to_string()),
        });
        let encoded = link.encode();
        assert!(encoded.starts_with("courrier://id/#"));
        assert_eq!(DeepLink::decode(&encoded).unwrap(), link);
    }

    #[test]
    fn group_link_round_trip() {
        let link = DeepLink::Group(GroupLink {
            group: GroupInvite {
                public_key: PublicKey::from("bb22"),
                secret: "s".to_string(),
                secret_sig: "sig".to_string(),
                group_type: GroupType::MultiMember,
            },
            display_name: "equipe".to_string(),
        });
        assert_eq!(DeepLink::decode(&link.encode()).unwrap(), link);
    }

    #[test]
    fn rejects_foreign_scheme() {
        assert!(matches!(
            DeepLink::decode("https://example.com/x"),
            Err(DeepLinkError::InvalidScheme)
        ));
    }

    #[test]
    fn rejects_garbage_payload() {
        assert!(DeepLink::decode("courrier://id/#%%%").is_err());
    }
}
