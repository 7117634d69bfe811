//! ClubMerge Migrations Module
//! Embedded, checksummed schema migrations with drift detection

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Schema drift detected: {0}")]
    SchemaDrift(String),
    #[error("Unknown migration recorded in database: {0}")]
    Unknown(String),
    #[error("SQL execution error: {0}")]
    SqlError(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.sql.as_bytes()))
    }
}

const JOURNAL_TABLE: &str = "CREATE TABLE IF NOT EXISTS _clubmerge_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL,
    checksum TEXT NOT NULL
)";

static EMBEDDED: &[Migration] = &[
    Migration {
        name: "0001_clubs",
        sql: "
CREATE TABLE clubs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE TABLE memberships (
    user_id INTEGER NOT NULL,
    club_id INTEGER NOT NULL REFERENCES clubs(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN ('member', 'organizer', 'admin')),
    joined_at TEXT NOT NULL,
    PRIMARY KEY (user_id, club_id)
);
CREATE TABLE meetings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    club_id INTEGER NOT NULL REFERENCES clubs(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    starts_at TEXT NOT NULL
);
CREATE TABLE documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    club_id INTEGER NOT NULL REFERENCES clubs(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    url TEXT NOT NULL
);
",
    },
    Migration {
        name: "0002_merge_requests",
        sql: "
CREATE TABLE merge_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    club_a_id INTEGER NOT NULL,
    club_b_id INTEGER NOT NULL,
    pair_low INTEGER NOT NULL,
    pair_high INTEGER NOT NULL,
    initiator_accepted INTEGER NOT NULL,
    target_accepted INTEGER NOT NULL,
    merged_club_id INTEGER,
    created_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    CHECK (club_a_id <> club_b_id)
);
CREATE UNIQUE INDEX idx_merge_requests_active_pair
    ON merge_requests (pair_low, pair_high) WHERE merged_club_id IS NULL;
CREATE INDEX idx_merge_requests_club_a ON merge_requests (club_a_id);
CREATE INDEX idx_merge_requests_club_b ON merge_requests (club_b_id);
",
    },
    Migration {
        name: "0003_merge_aggregations",
        sql: "
CREATE TABLE merge_aggregations (
    merge_request_id INTEGER PRIMARY KEY,
    merged_club_id INTEGER NOT NULL REFERENCES clubs(id),
    created_at TEXT NOT NULL
);
",
    },
    Migration {
        // Merged clubs are ordinary clubs and may be deleted later
        name: "0004_merge_aggregations_unlink_clubs",
        sql: "
CREATE TABLE merge_aggregations_new (
    merge_request_id INTEGER PRIMARY KEY,
    merged_club_id INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
INSERT INTO merge_aggregations_new (merge_request_id, merged_club_id, created_at)
    SELECT merge_request_id, merged_club_id, created_at FROM merge_aggregations;
DROP TABLE merge_aggregations;
ALTER TABLE merge_aggregations_new RENAME TO merge_aggregations;
",
    },
];

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub applied_count: usize,
    pub pending_count: usize,
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

pub struct MigrationRunner {
    migrations: &'static [Migration],
}

impl MigrationRunner {
    pub fn embedded() -> Self {
        Self { migrations: EMBEDDED }
    }

    fn applied(conn: &Connection) -> Result<Vec<(String, String)>, MigrationError> {
        conn.execute(JOURNAL_TABLE, [])?;
        let mut stmt = conn.prepare("SELECT name, checksum FROM _clubmerge_migrations ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(rows)
    }

    /// Compare the journal against the embedded list.
    pub fn check(&self, conn: &Connection) -> Result<MigrationStatus, MigrationError> {
        let applied = Self::applied(conn)?;

        for (name, checksum) in &applied {
            match self.migrations.iter().find(|m| m.name == name) {
                Some(m) if m.checksum() != *checksum => {
                    return Err(MigrationError::SchemaDrift(format!(
                        "{} was applied with checksum {} but the embedded copy is {}",
                        name,
                        checksum,
                        m.checksum()
                    )));
                }
                Some(_) => {}
                None => return Err(MigrationError::Unknown(name.clone())),
            }
        }

        let pending: Vec<String> = self
            .migrations
            .iter()
            .filter(|m| !applied.iter().any(|(name, _)| name == m.name))
            .map(|m| m.name.to_string())
            .collect();

        Ok(MigrationStatus {
            applied_count: applied.len(),
            pending_count: pending.len(),
            applied: applied.into_iter().map(|(name, _)| name).collect(),
            pending,
        })
    }

    /// Apply every pending migration, each in its own transaction.
    pub fn push(&self, conn: &mut Connection) -> Result<Vec<String>, MigrationError> {
        let status = self.check(conn)?;
        let mut applied = Vec::new();

        for migration in self.migrations.iter().filter(|m| status.pending.iter().any(|p| p == m.name)) {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql)?;
            tx.execute(
                "INSERT INTO _clubmerge_migrations (name, applied_at, checksum) VALUES (?1, datetime('now'), ?2)",
                params![migration.name, migration.checksum()],
            )?;
            tx.commit()?;
            applied.push(migration.name.to_string());
        }

        Ok(applied)
    }
}
