//! Core domain types for the georeferencing system.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Control points and transform families
//! - Documents, their active fit and the fit history ledger
//! - Tile job typestate machine

/// Declares a UUID-backed identifier newtype.
///
/// Identifiers display only their first 8 characters for readability in logs.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(uuid: uuid::Uuid) -> Self {
                $name(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = uuid::Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }
    };
}

pub(crate) use uuid_id;

pub mod control_point;
pub mod document;
pub mod job;
