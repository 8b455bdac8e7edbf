//! Opaque identifiers and common records
//!
//! Identifiers are uuid-v4 newtypes so they cannot be confused with one
//! another or with plain strings in signatures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            /// Wrap an existing uuid
            pub fn from_uuid(id: Uuid) -> Self {
                $name(id)
            }

            /// Parse from the string form produced by `Display`
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map($name)
            }

            /// Access the inner uuid
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a lease held by the lock manager
    LockId
);
uuid_id!(
    /// Identifier of an outbox event
    EventId
);
uuid_id!(
    /// Identifier of a commit in the DocStore's history graph
    CommitId
);
uuid_id!(
    /// Identifier of an audit record
    AuditId
);

/// Who performed an action: a human user or a service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable actor id
    pub id: String,
    /// Display name (username or service name)
    pub name: String,
    /// True for service accounts
    pub is_service: bool,
}

impl Actor {
    /// A human user
    pub fn user(id: impl Into<String>, name: impl Into<String>) -> Self {
        Actor {
            id: id.into(),
            name: name.into(),
            is_service: false,
        }
    }

    /// A service account; id and name are the service name
    pub fn service(name: impl Into<String>) -> Self {
        let name = name.into();
        Actor {
            id: name.clone(),
            name,
            is_service: true,
        }
    }

    /// The implicit system actor used by background tasks
    pub fn system() -> Self {
        Actor::service("system")
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A JSON document stored in a DocStore collection.
///
/// The body is an opaque JSON tree; subsystems define their own record
/// shapes and (de)serialize through `serde`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary key within the collection
    pub id: String,
    /// Document payload
    pub body: serde_json::Value,
}

impl Document {
    /// Create a document from an id and body
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Document {
            id: id.into(),
            body,
        }
    }

    /// Serialize a record type into a document keyed by `id`
    pub fn from_record<T: Serialize>(
        id: impl Into<String>,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Document {
            id: id.into(),
            body: serde_json::to_value(record)?,
        })
    }

    /// Deserialize the body into a record type
    pub fn to_record<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

/// Current UTC time.
///
/// Single call site for the wall clock so time-dependent logic stays easy
/// to audit. Sweepers and retention take explicit `now` parameters on their
/// `_at` variants; this is the default they feed in.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_roundtrip() {
        let id = LockId::new();
        let parsed = LockId::parse(&id.to_string());
        assert_eq!(parsed, Some(id));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_serde_transparent() {
        let id = CommitId::new();
        let json = serde_json::to_string(&id).unwrap();
        // Serializes as a bare string, not a struct
        assert!(json.starts_with('"'));
        let back: CommitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_actor_constructors() {
        let user = Actor::user("u-1", "alice");
        assert!(!user.is_service);
        assert_eq!(user.to_string(), "alice");

        let svc = Actor::service("indexer");
        assert!(svc.is_service);
        assert_eq!(svc.id, "indexer");

        assert!(Actor::system().is_service);
    }

    #[test]
    fn test_document_record_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Rec {
            n: u32,
            s: String,
        }

        let rec = Rec {
            n: 7,
            s: "x".into(),
        };
        let doc = Document::from_record("r1", &rec).unwrap();
        assert_eq!(doc.id, "r1");
        let back: Rec = doc.to_record().unwrap();
        assert_eq!(back, rec);
    }
}
