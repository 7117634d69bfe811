//! Club Aggregation
//!
//! Combines two clubs' memberships, meetings and documents into a new club
//! once both sides of a merge request have accepted.
//!
//! Aggregation is idempotent on the merge request id: the first successful
//! run records `merge_request_id -> merged_club_id` in `merge_aggregations`
//! and every later call returns that club without touching anything else.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::engine::database::{Database, DatabaseError};
use crate::engine::merge::model::{ClubId, MergeRequest, MergeRequestId, UserId};
use crate::engine::rbac::Role;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Club not found: {0}")]
    ClubNotFound(ClubId),
    #[error("Merge request {0} has not been accepted by both clubs")]
    NotReady(MergeRequestId),
    #[error("Merge request {0} is no longer open")]
    Closed(MergeRequestId),
    #[error("Aggregation service unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for AggregationError {
    fn from(e: rusqlite::Error) -> Self {
        AggregationError::Database(DatabaseError::SqliteError(e))
    }
}

/// Performs the actual merge of two clubs and returns the resulting club.
pub trait ClubAggregator: Send + Sync {
    /// Must return the same club id for repeated calls with the same request id.
    fn aggregate(&self, request: &MergeRequest) -> Result<ClubId, AggregationError>;
}

#[derive(Clone)]
pub struct SqliteClubAggregator {
    db: Database,
}

impl SqliteClubAggregator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Club previously produced for this merge request, if any.
    pub fn recorded(&self, id: MergeRequestId) -> Result<Option<ClubId>, AggregationError> {
        let conn = self.db.get_connection()?;
        let club = conn
            .query_row(
                "SELECT merged_club_id FROM merge_aggregations WHERE merge_request_id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(club)
    }
}

fn rank_role(raw: &str) -> Role {
    raw.parse().unwrap_or(Role::Member)
}

impl ClubAggregator for SqliteClubAggregator {
    fn aggregate(&self, request: &MergeRequest) -> Result<ClubId, AggregationError> {
        if !request.both_accepted() {
            return Err(AggregationError::NotReady(request.id));
        }

        let mut conn = self.db.get_connection()?;
        // IMMEDIATE takes the write lock up front so concurrent finalizers serialize here
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<ClubId> = tx
            .query_row(
                "SELECT merged_club_id FROM merge_aggregations WHERE merge_request_id = ?1",
                [request.id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(club) = existing {
            tracing::debug!(merge_request = %request.id, merged_club = %club, "aggregation already recorded");
            return Ok(club);
        }

        // A cancel may have removed the row after the caller read it
        let live: Option<(bool, bool, Option<ClubId>)> = tx
            .query_row(
                "SELECT initiator_accepted, target_accepted, merged_club_id FROM merge_requests WHERE id = ?1",
                [request.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match live {
            Some((true, true, None)) => {}
            Some((_, _, None)) => return Err(AggregationError::NotReady(request.id)),
            _ => return Err(AggregationError::Closed(request.id)),
        }

        let load = |club: ClubId| -> Result<(String, String), AggregationError> {
            tx.query_row("SELECT name, description FROM clubs WHERE id = ?1", [club], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
            .ok_or(AggregationError::ClubNotFound(club))
        };
        let (name_a, desc_a) = load(request.club_a_id)?;
        let (name_b, desc_b) = load(request.club_b_id)?;

        let description = [desc_a.trim(), desc_b.trim()]
            .into_iter()
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let now = Utc::now();
        tx.execute(
            "INSERT INTO clubs (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![format!("{} x {}", name_a, name_b), description, now],
        )?;
        let merged = ClubId(tx.last_insert_rowid());

        // A user in both clubs keeps the higher of their two roles
        let mut roles: BTreeMap<UserId, Role> = BTreeMap::new();
        {
            let mut stmt = tx.prepare("SELECT user_id, role FROM memberships WHERE club_id IN (?1, ?2)")?;
            let rows = stmt.query_map(params![request.club_a_id, request.club_b_id], |row| {
                Ok((row.get::<_, UserId>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (user, role) = row?;
                let role = rank_role(&role);
                roles
                    .entry(user)
                    .and_modify(|r| *r = r.higher(role))
                    .or_insert(role);
            }
        }
        for (user, role) in &roles {
            tx.execute(
                "INSERT INTO memberships (user_id, club_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
                params![user, merged, role.as_str(), now],
            )?;
        }

        let meetings = tx.execute(
            "INSERT INTO meetings (club_id, title, starts_at)
             SELECT ?1, title, starts_at FROM meetings WHERE club_id IN (?2, ?3) ORDER BY starts_at, id",
            params![merged, request.club_a_id, request.club_b_id],
        )?;
        let documents = tx.execute(
            "INSERT INTO documents (club_id, title, url)
             SELECT ?1, title, url FROM documents WHERE club_id IN (?2, ?3) ORDER BY id",
            params![merged, request.club_a_id, request.club_b_id],
        )?;

        tx.execute(
            "INSERT INTO merge_aggregations (merge_request_id, merged_club_id, created_at) VALUES (?1, ?2, ?3)",
            params![request.id, merged, now],
        )?;
        tx.commit()?;

        tracing::info!(
            merge_request = %request.id,
            merged_club = %merged,
            members = roles.len(),
            meetings,
            documents,
            "clubs aggregated"
        );
        Ok(merged)
    }
}
