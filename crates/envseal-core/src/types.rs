//! Strong type definitions for envseal.
//!
//! All identifiers are newtypes to prevent misuse at compile time. The
//! server hands out opaque string ids; new ids minted on the client are
//! UUID v4 strings.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Mint a fresh random id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Borrow the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// A signed-in account on this device: one user in one org.
    AccountId
);

string_id!(
    /// An organization.
    OrgId
);

string_id!(
    /// A person or CLI identity in the org.
    UserId
);

string_id!(
    /// Any graph object that holds a pubkey: devices, CLI users, invites,
    /// device grants, recovery keys, generated envkeys, and the servers and
    /// local keys that own generated envkeys.
    KeyableId
);

string_id!(
    /// An app or a block: anything that owns environments.
    EnvParentId
);

string_id!(
    /// A base environment, a sub-environment, or a locals environment.
    EnvironmentId
);

string_id!(
    /// An org, app, or environment role.
    RoleId
);

string_id!(
    /// A server-side request object (root replacements, revocation requests).
    RequestId
);

impl EnvironmentId {
    /// The locals environment of `user_id` inside `env_parent_id`.
    pub fn locals(env_parent_id: &EnvParentId, user_id: &UserId) -> Self {
        Self(format!("{}|{}", env_parent_id, user_id))
    }

    /// Split a locals environment id into its env-parent and user.
    ///
    /// Returns `None` for base and sub environments.
    pub fn parse_locals(&self) -> Option<(EnvParentId, UserId)> {
        let (parent, user) = self.0.split_once('|')?;
        Some((EnvParentId::new(parent), UserId::new(user)))
    }

    /// Whether this id addresses a locals environment.
    pub fn is_locals(&self) -> bool {
        self.0.contains('|')
    }
}

impl UserId {
    /// CLI users hold their own pubkey, so the user id doubles as a keyable id.
    pub fn as_keyable(&self) -> KeyableId {
        KeyableId(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locals_id_roundtrip() {
        let parent = EnvParentId::new("app-1");
        let user = UserId::new("user-9");
        let id = EnvironmentId::locals(&parent, &user);

        assert!(id.is_locals());
        assert_eq!(id.parse_locals(), Some((parent, user)));
    }

    #[test]
    fn test_base_environment_is_not_locals() {
        let id = EnvironmentId::new("env-prod");
        assert!(!id.is_locals());
        assert_eq!(id.parse_locals(), None);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(KeyableId::generate(), KeyableId::generate());
    }

    #[test]
    fn test_id_debug_and_display() {
        let id = UserId::new("abc");
        assert_eq!(format!("{}", id), "abc");
        assert_eq!(format!("{:?}", id), "UserId(abc)");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = EnvParentId::new("app-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"app-1\"");
    }
}
