//! Club Role Policy
//!
//! Membership roles and the capabilities each one grants

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Capabilities checked by the merge protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Create, accept, finalize and cancel merge requests for a club
    ManageMerges,
}

/// A user's role within one club
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Organizer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Organizer => "organizer",
            Role::Admin => "admin",
        }
    }

    /// Whether this role grants `capability`
    pub fn grants(&self, capability: Capability) -> bool {
        match capability {
            Capability::ManageMerges => matches!(self, Role::Organizer | Role::Admin),
        }
    }

    /// Role kept when the same user belongs to both merging clubs
    pub fn higher(self, other: Role) -> Role {
        self.max(other)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "member" => Ok(Role::Member),
            "organizer" => Ok(Role::Organizer),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}
