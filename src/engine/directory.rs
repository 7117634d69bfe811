//! Club Directory
//!
//! Club existence, names and organizer-role lookup. The merge protocol only
//! sees the [`ClubDirectory`] trait; [`SqliteClubDirectory`] is the default
//! backing store and also owns club/membership administration.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::database::{Database, DatabaseError};
use crate::engine::merge::model::{ClubId, MergeRequestId, UserId};
use crate::engine::rbac::{Capability, Role};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Club not found: {0}")]
    ClubNotFound(ClubId),
    #[error("Club {club} has an active merge request ({merge_request}); cancel it first")]
    ClubInUse {
        club: ClubId,
        merge_request: MergeRequestId,
    },
    #[error("Invalid club data: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for DirectoryError {
    fn from(e: rusqlite::Error) -> Self {
        DirectoryError::Database(DatabaseError::SqliteError(e))
    }
}

/// Lookups the merge protocol needs from the club directory.
pub trait ClubDirectory: Send + Sync {
    fn club_exists(&self, club: ClubId) -> Result<bool, DirectoryError>;

    fn club_name(&self, club: ClubId) -> Result<Option<String>, DirectoryError>;

    /// The user's role in the club, if they are a member at all.
    fn get_membership(&self, user: UserId, club: ClubId) -> Result<Option<Role>, DirectoryError>;

    fn is_organizer(&self, user: UserId, club: ClubId) -> Result<bool, DirectoryError> {
        Ok(self
            .get_membership(user, club)?
            .is_some_and(|role| role.grants(Capability::ManageMerges)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Club {
    pub id: ClubId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub club_id: ClubId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: i64,
    pub club_id: ClubId,
    pub title: String,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub club_id: ClubId,
    pub title: String,
    pub url: String,
}

fn parse_role(raw: String) -> rusqlite::Result<Role> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

#[derive(Clone)]
pub struct SqliteClubDirectory {
    db: Database,
}

impl SqliteClubDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_club(&self, name: &str, description: &str) -> Result<Club, DirectoryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DirectoryError::Invalid("club name must not be empty".to_string()));
        }

        let conn = self.db.get_connection()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO clubs (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, created_at],
        )?;
        Ok(Club {
            id: ClubId(conn.last_insert_rowid()),
            name: name.to_string(),
            description: description.to_string(),
            created_at,
        })
    }

    pub fn get_club(&self, club: ClubId) -> Result<Option<Club>, DirectoryError> {
        let conn = self.db.get_connection()?;
        let found = conn
            .query_row(
                "SELECT id, name, description, created_at FROM clubs WHERE id = ?1",
                [club],
                |row| {
                    Ok(Club {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_clubs(&self) -> Result<Vec<Club>, DirectoryError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare("SELECT id, name, description, created_at FROM clubs ORDER BY id")?;
        let clubs = stmt
            .query_map([], |row| {
                Ok(Club {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clubs)
    }

    /// Add a member, or change the role of an existing one.
    pub fn add_membership(&self, user: UserId, club: ClubId, role: Role) -> Result<Membership, DirectoryError> {
        if !self.club_exists(club)? {
            return Err(DirectoryError::ClubNotFound(club));
        }

        let conn = self.db.get_connection()?;
        let joined_at = Utc::now();
        conn.execute(
            "INSERT INTO memberships (user_id, club_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, club_id) DO UPDATE SET role = excluded.role",
            params![user, club, role.as_str(), joined_at],
        )?;
        let joined_at = conn.query_row(
            "SELECT joined_at FROM memberships WHERE user_id = ?1 AND club_id = ?2",
            params![user, club],
            |row| row.get(0),
        )?;
        Ok(Membership {
            user_id: user,
            club_id: club,
            role,
            joined_at,
        })
    }

    pub fn list_members(&self, club: ClubId) -> Result<Vec<Membership>, DirectoryError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, club_id, role, joined_at FROM memberships WHERE club_id = ?1 ORDER BY user_id",
        )?;
        let members = stmt
            .query_map([club], |row| {
                Ok(Membership {
                    user_id: row.get(0)?,
                    club_id: row.get(1)?,
                    role: parse_role(row.get(2)?)?,
                    joined_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    pub fn add_meeting(&self, club: ClubId, title: &str, starts_at: DateTime<Utc>) -> Result<Meeting, DirectoryError> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO meetings (club_id, title, starts_at) VALUES (?1, ?2, ?3)",
            params![club, title, starts_at],
        )?;
        Ok(Meeting {
            id: conn.last_insert_rowid(),
            club_id: club,
            title: title.to_string(),
            starts_at,
        })
    }

    pub fn list_meetings(&self, club: ClubId) -> Result<Vec<Meeting>, DirectoryError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, club_id, title, starts_at FROM meetings WHERE club_id = ?1 ORDER BY starts_at, id",
        )?;
        let meetings = stmt
            .query_map([club], |row| {
                Ok(Meeting {
                    id: row.get(0)?,
                    club_id: row.get(1)?,
                    title: row.get(2)?,
                    starts_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(meetings)
    }

    pub fn add_document(&self, club: ClubId, title: &str, url: &str) -> Result<Document, DirectoryError> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO documents (club_id, title, url) VALUES (?1, ?2, ?3)",
            params![club, title, url],
        )?;
        Ok(Document {
            id: conn.last_insert_rowid(),
            club_id: club,
            title: title.to_string(),
            url: url.to_string(),
        })
    }

    pub fn list_documents(&self, club: ClubId) -> Result<Vec<Document>, DirectoryError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare("SELECT id, club_id, title, url FROM documents WHERE club_id = ?1 ORDER BY id")?;
        let documents = stmt
            .query_map([club], |row| {
                Ok(Document {
                    id: row.get(0)?,
                    club_id: row.get(1)?,
                    title: row.get(2)?,
                    url: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(documents)
    }

    /// Delete a club. Refused while the club is party to an unmerged request.
    pub fn delete_club(&self, club: ClubId) -> Result<(), DirectoryError> {
        let mut conn = self.db.get_connection()?;
        let tx = conn.transaction()?;

        let active: Option<MergeRequestId> = tx
            .query_row(
                "SELECT id FROM merge_requests
                 WHERE (club_a_id = ?1 OR club_b_id = ?1) AND merged_club_id IS NULL
                 ORDER BY id LIMIT 1",
                [club],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(merge_request) = active {
            return Err(DirectoryError::ClubInUse { club, merge_request });
        }

        let deleted = tx.execute("DELETE FROM clubs WHERE id = ?1", [club])?;
        if deleted == 0 {
            return Err(DirectoryError::ClubNotFound(club));
        }
        tx.commit()?;
        tracing::info!(club = %club, "club deleted");
        Ok(())
    }
}

impl ClubDirectory for SqliteClubDirectory {
    fn club_exists(&self, club: ClubId) -> Result<bool, DirectoryError> {
        let conn = self.db.get_connection()?;
        let exists = conn.query_row("SELECT EXISTS(SELECT 1 FROM clubs WHERE id = ?1)", [club], |row| {
            row.get(0)
        })?;
        Ok(exists)
    }

    fn club_name(&self, club: ClubId) -> Result<Option<String>, DirectoryError> {
        let conn = self.db.get_connection()?;
        let name = conn
            .query_row("SELECT name FROM clubs WHERE id = ?1", [club], |row| row.get(0))
            .optional()?;
        Ok(name)
    }

    fn get_membership(&self, user: UserId, club: ClubId) -> Result<Option<Role>, DirectoryError> {
        let conn = self.db.get_connection()?;
        let role = conn
            .query_row(
                "SELECT role FROM memberships WHERE user_id = ?1 AND club_id = ?2",
                params![user, club],
                |row| parse_role(row.get(0)?),
            )
            .optional()?;
        Ok(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> SqliteClubDirectory {
        SqliteClubDirectory::new(Database::in_memory().unwrap())
    }

    #[test]
    fn test_create_and_lookup_club() {
        let dir = directory();
        let club = dir.create_club("Robotics", "Build robots").unwrap();

        assert!(dir.club_exists(club.id).unwrap());
        assert_eq!(dir.club_name(club.id).unwrap().as_deref(), Some("Robotics"));
        assert!(!dir.club_exists(ClubId(999)).unwrap());
        assert_eq!(dir.list_clubs().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_club_name_rejected() {
        let dir = directory();
        assert!(matches!(dir.create_club("  ", ""), Err(DirectoryError::Invalid(_))));
    }

    #[test]
    fn test_membership_upsert() {
        let dir = directory();
        let club = dir.create_club("Chess", "").unwrap().id;

        dir.add_membership(UserId(5), club, Role::Member).unwrap();
        assert!(!dir.is_organizer(UserId(5), club).unwrap());

        dir.add_membership(UserId(5), club, Role::Organizer).unwrap();
        assert!(dir.is_organizer(UserId(5), club).unwrap());
        assert_eq!(dir.list_members(club).unwrap().len(), 1);

        assert!(matches!(
            dir.add_membership(UserId(5), ClubId(404), Role::Member),
            Err(DirectoryError::ClubNotFound(_))
        ));
    }

    #[test]
    fn test_delete_club_without_requests() {
        let dir = directory();
        let club = dir.create_club("Drama", "").unwrap().id;
        dir.add_membership(UserId(1), club, Role::Organizer).unwrap();

        dir.delete_club(club).unwrap();
        assert!(!dir.club_exists(club).unwrap());
        assert!(dir.get_membership(UserId(1), club).unwrap().is_none());
        assert!(matches!(dir.delete_club(club), Err(DirectoryError::ClubNotFound(_))));
    }

    #[test]
    fn test_delete_club_produced_by_merge() {
        use crate::engine::merge::MergeEngine;

        let db = Database::in_memory().unwrap();
        let dir = SqliteClubDirectory::new(db.clone());
        let chess = dir.create_club("Chess", "").unwrap().id;
        let go = dir.create_club("Go", "").unwrap().id;
        dir.add_membership(UserId(1), chess, Role::Organizer).unwrap();
        dir.add_membership(UserId(2), go, Role::Organizer).unwrap();

        let engine = MergeEngine::sqlite(&db);
        let request = engine.create(chess, go, UserId(1)).unwrap();
        let merged = engine.accept(request.id, UserId(2)).unwrap().merged_club_id.unwrap();

        dir.delete_club(merged).unwrap();
        assert!(!dir.club_exists(merged).unwrap());
        // Source clubs are free too once the request is merged
        dir.delete_club(chess).unwrap();
        assert_eq!(engine.get(request.id).unwrap().merged_club_id, Some(merged));
    }
}
