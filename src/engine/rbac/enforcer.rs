//! RBAC Enforcement Layer
//!
//! Request-level authorization against club memberships

use serde::{Deserialize, Serialize};

use super::policy::Capability;
use crate::engine::directory::{ClubDirectory, DirectoryError};
use crate::engine::merge::model::{ClubId, MergeRequest, MergeSide, UserId};

/// Authorization request context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
}

impl AuthContext {
    pub fn for_user(user_id: UserId) -> Self {
        Self { user_id }
    }
}

/// Authorization result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AuthResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// The enforcement engine
pub struct Enforcer<'a> {
    directory: &'a dyn ClubDirectory,
}

impl<'a> Enforcer<'a> {
    pub fn new(directory: &'a dyn ClubDirectory) -> Self {
        Self { directory }
    }

    /// Check a capability on a single club
    pub fn authorize(
        &self,
        context: &AuthContext,
        club: ClubId,
        capability: Capability,
    ) -> Result<AuthResult, DirectoryError> {
        match self.directory.get_membership(context.user_id, club)? {
            Some(role) if role.grants(capability) => Ok(AuthResult::allow()),
            Some(role) => Ok(AuthResult::deny(&format!(
                "role '{}' in club {} does not allow {:?}",
                role, club, capability
            ))),
            None => Ok(AuthResult::deny(&format!("not a member of club {}", club))),
        }
    }

    /// Sides of `request` the caller may act for, initiator first
    pub fn managed_sides(
        &self,
        context: &AuthContext,
        request: &MergeRequest,
    ) -> Result<Vec<MergeSide>, DirectoryError> {
        let mut sides = Vec::with_capacity(2);
        for side in [MergeSide::Initiator, MergeSide::Target] {
            if self
                .authorize(context, request.club_on(side), Capability::ManageMerges)?
                .allowed
            {
                sides.push(side);
            }
        }
        Ok(sides)
    }
}
