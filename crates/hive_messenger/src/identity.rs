//! Peer identity: opaque per-instance identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one messenger instance.
///
/// Ids are opaque and compared byte for byte. On the wire a `PeerId` is a
/// bare JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Fresh random id for an instance that was not given one.
    pub fn generate() -> Self {
        Uuid::new_v4().hyphenated().to_string().into()
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_peer_id_from_string() {
        let id = PeerId::from_string("runtime-1");
        assert_eq!(id.as_str(), "runtime-1");
        assert_eq!(format!("{id}"), "runtime-1");
        assert_eq!(PeerId::from("runtime-1"), id);
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::from_string("panel-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"panel-7\"");
    }
}
