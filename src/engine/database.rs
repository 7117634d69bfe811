//! ClubMerge Database Module
//! SQLite adapter with connection pooling

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use thiserror::Error;

use crate::engine::migrations::{MigrationError, MigrationRunner, MigrationStatus};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),
}

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

fn configure(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
}

impl Database {
    /// Open (or create) the database file and bring its schema up to date.
    pub fn new(db_path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(configure);
        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self { pool };
        db.init_schema(true)?;
        Ok(db)
    }

    /// Single-connection in-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let manager = SqliteConnectionManager::memory().with_init(configure);
        let pool = Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool };
        db.init_schema(false)?;
        Ok(db)
    }

    fn init_schema(&self, wal: bool) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get()?;

        if wal {
            // PRAGMA journal_mode returns the resulting mode as a row
            let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }

        let applied = MigrationRunner::embedded().push(&mut conn)?;
        if !applied.is_empty() {
            tracing::info!(migrations = ?applied, "applied schema migrations");
        }
        Ok(())
    }

    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        Ok(self.pool.get()?)
    }

    pub fn migration_status(&self) -> Result<MigrationStatus, DatabaseError> {
        let conn = self.get_connection()?;
        Ok(MigrationRunner::embedded().check(&conn)?)
    }

    pub fn get_tables(&self) -> Result<Vec<String>, DatabaseError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_clubmerge\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tables)
    }

    /// Row count of a known table.
    pub fn count_rows(&self, table: &str) -> Result<i64, DatabaseError> {
        let conn = self.get_connection()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}
