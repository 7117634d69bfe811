//! Merge protocol error types

use thiserror::Error;

use super::model::{ClubId, MergeRequestId, UserId};
use crate::engine::aggregation::AggregationError;
use crate::engine::database::DatabaseError;
use crate::engine::directory::DirectoryError;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("User {user} is not an organizer of {scope}")]
    Forbidden { user: UserId, scope: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("A club cannot merge with itself (club {0})")]
    InvalidPair(ClubId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Merge request {0} has already been merged")]
    AlreadyMerged(MergeRequestId),

    #[error("Merge request {0} is still waiting for a club to accept")]
    NotReady(MergeRequestId),

    /// The record stays accepted-but-unmerged and can be finalized again.
    #[error("Merging clubs for request {id} failed: {source}")]
    AggregationFailed {
        id: MergeRequestId,
        #[source]
        source: AggregationError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl MergeError {
    pub fn request_not_found(id: MergeRequestId) -> Self {
        MergeError::NotFound(format!("Merge request {}", id))
    }

    pub fn club_not_found(club: ClubId) -> Self {
        MergeError::NotFound(format!("Club {}", club))
    }

    /// Stable snake_case name for API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            MergeError::Forbidden { .. } => "forbidden",
            MergeError::NotFound(_) => "not_found",
            MergeError::InvalidPair(_) => "invalid_pair",
            MergeError::Conflict(_) => "conflict",
            MergeError::AlreadyMerged(_) => "already_merged",
            MergeError::NotReady(_) => "not_ready",
            MergeError::AggregationFailed { .. } => "aggregation_failed",
            MergeError::Storage(_) => "storage",
        }
    }
}

impl From<DirectoryError> for MergeError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Database(db) => MergeError::Storage(db),
            DirectoryError::ClubNotFound(club) => MergeError::club_not_found(club),
            DirectoryError::ClubInUse { club, merge_request } => MergeError::Conflict(format!(
                "club {} is part of active merge request {}",
                club, merge_request
            )),
            DirectoryError::Invalid(msg) => MergeError::Conflict(msg),
        }
    }
}

impl From<rusqlite::Error> for MergeError {
    fn from(e: rusqlite::Error) -> Self {
        MergeError::Storage(DatabaseError::SqliteError(e))
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
