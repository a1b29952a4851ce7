//! Core data model.
//!
//! Campaigns move through a fixed lifecycle; each attached contact walks a
//! sequence of timed emails; jobs are the durable units of deferred work that
//! drive those sends.

pub mod campaign;
pub mod contact;
pub mod job;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Newtype for campaign IDs.
    CampaignId
);
id_type!(
    /// Newtype for contact IDs.
    ContactId
);
id_type!(
    /// Newtype for job IDs.
    JobId
);
id_type!(
    /// The user who owns a campaign. Every campaign operation is scoped to one.
    OwnerId
);
