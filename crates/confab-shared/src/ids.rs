use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// URI scheme prefix shared by every entity id.
pub const ID_PREFIX: &str = "confab:///";

/// Marker embedded in locally generated ids that have not yet been
/// confirmed by the server.
pub const TEMP_MARKER: &str = "temp-";

/// The kind of a syncable resource, as carried in the `object.type`
/// field of change frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Conversation,
    Message,
    User,
}

impl EntityKind {
    /// Path segment used inside entity ids (`confab:///conversations/...`).
    pub fn path_segment(&self) -> &'static str {
        match self {
            EntityKind::Conversation => "conversations",
            EntityKind::Message => "messages",
            EntityKind::User => "users",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "conversations" => Some(EntityKind::Conversation),
            "messages" => Some(EntityKind::Message),
            "users" => Some(EntityKind::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path_segment().trim_end_matches('s'))
    }
}

/// A URI-like entity identifier: `confab:///conversations/<uuid>`.
///
/// Until server-confirmed, a locally created entity carries a temporary
/// id whose last segment starts with `temp-`; the id is later reconciled
/// to the server-assigned one by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Build an id from a kind and the server-assigned uuid suffix.
    pub fn new(kind: EntityKind, suffix: &str) -> Self {
        Self(format!("{}{}/{}", ID_PREFIX, kind.path_segment(), suffix))
    }

    /// Generate a fresh temporary id for a locally created entity.
    pub fn temporary(kind: EntityKind) -> Self {
        Self(format!(
            "{}{}/{}{}",
            ID_PREFIX,
            kind.path_segment(),
            TEMP_MARKER,
            Uuid::new_v4()
        ))
    }

    /// Parse and validate an id string.
    ///
    /// Programmer errors (wrong scheme, unknown kind, empty suffix) are
    /// reported synchronously; they are never queued or retried.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s
            .strip_prefix(ID_PREFIX)
            .ok_or_else(|| IdError::BadScheme(s.to_string()))?;
        let (segment, suffix) = rest
            .split_once('/')
            .ok_or_else(|| IdError::Malformed(s.to_string()))?;
        EntityKind::from_segment(segment).ok_or_else(|| IdError::UnknownKind(segment.to_string()))?;
        if suffix.is_empty() || suffix.contains('/') {
            return Err(IdError::Malformed(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The kind encoded in this id, if the id is well formed.
    pub fn kind(&self) -> Option<EntityKind> {
        let rest = self.0.strip_prefix(ID_PREFIX)?;
        let (segment, _) = rest.split_once('/')?;
        EntityKind::from_segment(segment)
    }

    /// Whether this is a locally generated placeholder id the server
    /// does not know about yet.
    pub fn is_temporary(&self) -> bool {
        self.suffix().starts_with(TEMP_MARKER)
    }

    /// The trailing uuid segment, used when building REST URLs.
    pub fn suffix(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_parse_roundtrip() {
        let id = EntityId::new(EntityKind::Conversation, "abc123");
        assert_eq!(id.as_str(), "confab:///conversations/abc123");
        assert_eq!(id.kind(), Some(EntityKind::Conversation));
        assert_eq!(id.suffix(), "abc123");
        assert!(!id.is_temporary());

        let parsed = EntityId::parse(id.as_str()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_temporary_ids_are_marked() {
        let id = EntityId::temporary(EntityKind::Message);
        assert!(id.is_temporary());
        assert_eq!(id.kind(), Some(EntityKind::Message));
        assert!(id.suffix().starts_with(TEMP_MARKER));
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(EntityId::parse("http:///conversations/x").is_err());
        assert!(EntityId::parse("confab:///widgets/x").is_err());
        assert!(EntityId::parse("confab:///conversations/").is_err());
        assert!(EntityId::parse("confab:///conversations").is_err());
        assert!(EntityId::parse("confab:///conversations/a/b").is_err());
    }
}
