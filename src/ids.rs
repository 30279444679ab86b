//! Opaque identifiers
//!
//! `UserId` and `RoomId` are supplied by the authenticated transport session,
//! not minted here. Wrapping them keeps a stray `String` from being passed
//! where a user or room is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

opaque_id!(UserId);
opaque_id!(RoomId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_roundtrips_through_json() {
        let id = UserId::new("user-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"user-42\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn distinct_ids_are_not_equal() {
        assert_ne!(UserId::new("a"), UserId::new("b"));
        assert_ne!(RoomId::new("a"), RoomId::new("b"));
    }
}
