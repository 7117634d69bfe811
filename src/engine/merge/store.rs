//! Merge Request Store
//!
//! Persistence contract for merge requests. All mutations are
//! compare-and-set on `version` and only apply to unmerged records, so a
//! caller holding a stale copy never overwrites a concurrent write.

use rusqlite::{params, OptionalExtension, Row};

use super::model::{ClubId, ClubPair, MergeRequest, MergeRequestId, NewMergeRequest};
use crate::engine::database::{Database, DatabaseError};

/// Result of inserting a new proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(MergeRequest),
    /// An unmerged request already exists for the same unordered pair.
    DuplicatePair,
}

/// Result of a conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The row moved on since `current` was read, or is already gone.
    Stale,
    /// The clubs have already been combined for this request; only the
    /// merged-club write is outstanding.
    Finalizing,
}

pub trait MergeStore: Send + Sync {
    fn insert(&self, new: &NewMergeRequest) -> Result<InsertOutcome, DatabaseError>;

    fn get(&self, id: MergeRequestId) -> Result<Option<MergeRequest>, DatabaseError>;

    /// The unmerged request for this pair, in either direction.
    fn find_active(&self, pair: ClubPair) -> Result<Option<MergeRequest>, DatabaseError>;

    /// Every stored request involving `club`, newest first.
    fn list_for_club(&self, club: ClubId) -> Result<Vec<MergeRequest>, DatabaseError>;

    /// Write `next`'s flags and merged club if the stored row still matches
    /// `current.version` and is unmerged. Returns the stored row on success,
    /// `None` when the write lost a race.
    fn compare_and_set(
        &self,
        current: &MergeRequest,
        next: &MergeRequest,
    ) -> Result<Option<MergeRequest>, DatabaseError>;

    /// Delete the row if it still matches `current.version`, is unmerged and
    /// has not been aggregated yet.
    fn delete_if_current(&self, current: &MergeRequest) -> Result<DeleteOutcome, DatabaseError>;
}

const COLUMNS: &str =
    "id, club_a_id, club_b_id, initiator_accepted, target_accepted, merged_club_id, created_at, version";

fn from_row(row: &Row<'_>) -> rusqlite::Result<MergeRequest> {
    Ok(MergeRequest {
        id: row.get(0)?,
        club_a_id: row.get(1)?,
        club_b_id: row.get(2)?,
        initiator_accepted: row.get(3)?,
        target_accepted: row.get(4)?,
        merged_club_id: row.get(5)?,
        created_at: row.get(6)?,
        version: row.get(7)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[derive(Clone)]
pub struct SqliteMergeStore {
    db: Database,
}

impl SqliteMergeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl MergeStore for SqliteMergeStore {
    fn insert(&self, new: &NewMergeRequest) -> Result<InsertOutcome, DatabaseError> {
        let conn = self.db.get_connection()?;
        let pair = new.pair();
        let inserted = conn.execute(
            "INSERT INTO merge_requests
                (club_a_id, club_b_id, pair_low, pair_high, initiator_accepted, target_accepted, created_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                new.club_a_id,
                new.club_b_id,
                pair.low,
                pair.high,
                new.initiator_accepted,
                new.target_accepted,
                new.created_at
            ],
        );

        match inserted {
            Ok(_) => Ok(InsertOutcome::Inserted(MergeRequest {
                id: MergeRequestId(conn.last_insert_rowid()),
                club_a_id: new.club_a_id,
                club_b_id: new.club_b_id,
                initiator_accepted: new.initiator_accepted,
                target_accepted: new.target_accepted,
                merged_club_id: None,
                created_at: new.created_at,
                version: 1,
            })),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::DuplicatePair),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: MergeRequestId) -> Result<Option<MergeRequest>, DatabaseError> {
        let conn = self.db.get_connection()?;
        let found = conn
            .query_row(
                &format!("SELECT {} FROM merge_requests WHERE id = ?1", COLUMNS),
                [id],
                from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn find_active(&self, pair: ClubPair) -> Result<Option<MergeRequest>, DatabaseError> {
        let conn = self.db.get_connection()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT {} FROM merge_requests
                     WHERE pair_low = ?1 AND pair_high = ?2 AND merged_club_id IS NULL",
                    COLUMNS
                ),
                params![pair.low, pair.high],
                from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn list_for_club(&self, club: ClubId) -> Result<Vec<MergeRequest>, DatabaseError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM merge_requests WHERE club_a_id = ?1 OR club_b_id = ?1
             ORDER BY created_at DESC, id DESC",
            COLUMNS
        ))?;
        let requests = stmt
            .query_map([club], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    fn compare_and_set(
        &self,
        current: &MergeRequest,
        next: &MergeRequest,
    ) -> Result<Option<MergeRequest>, DatabaseError> {
        let conn = self.db.get_connection()?;
        // OR keeps acceptance monotonic even if a caller passes a lowered flag
        let changed = conn.execute(
            "UPDATE merge_requests
             SET initiator_accepted = (initiator_accepted OR ?1),
                 target_accepted = (target_accepted OR ?2),
                 merged_club_id = ?3,
                 version = version + 1
             WHERE id = ?4 AND version = ?5 AND merged_club_id IS NULL",
            params![
                next.initiator_accepted,
                next.target_accepted,
                next.merged_club_id,
                current.id,
                current.version
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(MergeRequest {
            initiator_accepted: current.initiator_accepted || next.initiator_accepted,
            target_accepted: current.target_accepted || next.target_accepted,
            merged_club_id: next.merged_club_id,
            version: current.version + 1,
            ..current.clone()
        }))
    }

    fn delete_if_current(&self, current: &MergeRequest) -> Result<DeleteOutcome, DatabaseError> {
        let conn = self.db.get_connection()?;
        let deleted = conn.execute(
            "DELETE FROM merge_requests
             WHERE id = ?1 AND version = ?2 AND merged_club_id IS NULL
               AND NOT EXISTS (SELECT 1 FROM merge_aggregations WHERE merge_request_id = ?1)",
            params![current.id, current.version],
        )?;
        if deleted == 1 {
            return Ok(DeleteOutcome::Deleted);
        }

        let aggregated: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM merge_aggregations WHERE merge_request_id = ?1)",
            [current.id],
            |row| row.get(0),
        )?;
        Ok(if aggregated {
            DeleteOutcome::Finalizing
        } else {
            DeleteOutcome::Stale
        })
    }
}
