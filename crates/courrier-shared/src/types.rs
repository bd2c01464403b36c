use serde::{Deserialize, Serialize};

/// A public key in its string form (lowercase hex of the raw key bytes).
///
/// The projection keys contacts, groups, members and devices by this string
/// encoding so that aggregates can be addressed uniformly regardless of
/// which remote call produced the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines. Falls back to the full string when the
    /// key is short or byte 8 is not a char boundary.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PublicKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a projected message aggregate.
///
/// Assigned by the remote service (the event-context id of the group-message
/// envelope) for received messages; locally synthesized (`cmd_N`) for the
/// diagnostic messages produced by slash-commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of cryptographic group held by the protocol service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupType {
    Account,
    Contact,
    MultiMember,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_round_trip() {
        let pk = PublicKey::from_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(pk.as_str(), "deadbeef");
        assert_eq!(pk.to_bytes().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn short_never_panics_on_tiny_keys() {
        let pk = PublicKey::from_bytes(&[0x01]);
        assert_eq!(pk.short(), "01");
    }

    #[test]
    fn short_respects_char_boundaries() {
        // byte 8 lands inside the 'é'
        let pk = PublicKey::from_string("abcdefgé-tail".to_string());
        assert_eq!(pk.short(), "abcdefgé-tail");

        let pk = PublicKey::from_string("abcdefgh-tail".to_string());
        assert_eq!(pk.short(), "abcdefgh");
    }
}
