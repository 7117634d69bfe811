//! Merge request records and identifier types

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

macro_rules! sql_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(n: i64) -> Self {
                $name(n)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map($name)
            }
        }
    };
}

sql_id!(
    /// A club in the directory.
    ClubId
);
sql_id!(
    /// A user account, as resolved by the session layer.
    UserId
);
sql_id!(
    /// A merge request row.
    MergeRequestId
);

/// Which end of a merge request a club sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeSide {
    Initiator,
    Target,
}

impl MergeSide {
    pub fn other(self) -> Self {
        match self {
            MergeSide::Initiator => MergeSide::Target,
            MergeSide::Target => MergeSide::Initiator,
        }
    }
}

/// Protocol state derived from the stored flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    PendingBoth,
    PendingOneSide,
    Ready,
    Merged,
}

/// A proposal to merge club A (initiator) with club B (target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub club_a_id: ClubId,
    pub club_b_id: ClubId,
    pub initiator_accepted: bool,
    pub target_accepted: bool,
    pub merged_club_id: Option<ClubId>,
    pub created_at: DateTime<Utc>,
    /// Write counter for compare-and-set updates.
    pub version: i64,
}

impl MergeRequest {
    pub fn state(&self) -> MergeState {
        match (self.initiator_accepted, self.target_accepted, self.merged_club_id) {
            (_, _, Some(_)) => MergeState::Merged,
            (true, true, None) => MergeState::Ready,
            (false, false, None) => MergeState::PendingBoth,
            _ => MergeState::PendingOneSide,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.merged_club_id.is_some()
    }

    pub fn both_accepted(&self) -> bool {
        self.initiator_accepted && self.target_accepted
    }

    /// Side `club` sits on, or `None` if it is not a party.
    pub fn side_of(&self, club: ClubId) -> Option<MergeSide> {
        if club == self.club_a_id {
            Some(MergeSide::Initiator)
        } else if club == self.club_b_id {
            Some(MergeSide::Target)
        } else {
            None
        }
    }

    pub fn club_on(&self, side: MergeSide) -> ClubId {
        match side {
            MergeSide::Initiator => self.club_a_id,
            MergeSide::Target => self.club_b_id,
        }
    }

    pub fn accepted(&self, side: MergeSide) -> bool {
        match side {
            MergeSide::Initiator => self.initiator_accepted,
            MergeSide::Target => self.target_accepted,
        }
    }

    /// Copy of this record with `side` marked accepted. Flags only ever go up.
    pub fn with_accepted(&self, side: MergeSide) -> Self {
        let mut next = self.clone();
        match side {
            MergeSide::Initiator => next.initiator_accepted = true,
            MergeSide::Target => next.target_accepted = true,
        }
        next
    }

    pub fn involves(&self, club: ClubId) -> bool {
        self.side_of(club).is_some()
    }
}

/// Unordered club pair, normalized low/high for lookups and the unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClubPair {
    pub low: ClubId,
    pub high: ClubId,
}

impl ClubPair {
    pub fn new(a: ClubId, b: ClubId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

/// Insert payload for a new merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMergeRequest {
    pub club_a_id: ClubId,
    pub club_b_id: ClubId,
    pub initiator_accepted: bool,
    pub target_accepted: bool,
    pub created_at: DateTime<Utc>,
}

impl NewMergeRequest {
    /// A fresh proposal. Creating a request counts as the initiator's acceptance.
    pub fn proposed(initiator: ClubId, target: ClubId) -> Self {
        Self {
            club_a_id: initiator,
            club_b_id: target,
            initiator_accepted: true,
            target_accepted: false,
            created_at: Utc::now(),
        }
    }

    pub fn pair(&self) -> ClubPair {
        ClubPair::new(self.club_a_id, self.club_b_id)
    }
}
