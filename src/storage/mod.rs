//! SQLite storage layer for the Critic cache
//!
//! This module handles persistent storage of:
//! - Changesets, their changed files, file differences and line blocks
//! - Content-addressed highlight artefacts and code contexts
//! - Permanent job errors
//! - Durable pub/sub reservations
//! - Review branches, updates and events
//!
//! Every write that stores a job result is idempotent: content-addressed rows
//! use insert-or-ignore and derived rows are updated by key, so re-running a
//! job after a crash leaves the row set unchanged.

mod changesets;
mod files;
mod highlight;
mod pubsub;
mod reviews;
mod schema;

pub use changesets::{
    ChangedFileRow, ChangedLines, Changeset, ChangesetError, ChangesetRequest, ChangesetStatus,
    ComparedFile, Examination, FileDifference, SET_ANALYSIS,
};
pub use files::RepositoryRecord;
pub use highlight::{
    CodeContextRow, HighlightFile, HighlightLink, HighlightRequestState, UnlinkedVersion,
    INSERT_CODE_CONTEXT, INSERT_HIGHLIGHT_LINE, MARK_HIGHLIGHTED,
};
pub use pubsub::ReservedMessage;
pub use reviews::{Branch, BranchUpdate, ReviewEvent};
pub use schema::SCHEMA;

use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Database connection wrapper
///
/// The connection sits behind a mutex so one `Database` can be shared by the
/// runner, the review updater and in-process handlers through an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

/// Which side of a file difference a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Old,
    New,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Old => "old",
            Side::New => "new",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counts across the cache tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub changesets: i64,
    pub changed_files: i64,
    pub file_differences: i64,
    pub changed_lines: i64,
    pub analysed_blocks: i64,
    pub highlight_files: i64,
    pub highlighted_files: i64,
    pub highlight_lines: i64,
    pub code_contexts: i64,
    pub errors: i64,
}

/// Apply the pragmas every connection to the cache uses
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    Ok(())
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;

        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.as_ref().to_path_buf()),
        };
        db.initialize()?;

        Ok(db)
    }

    /// Open a database another process has initialised, leaving the schema
    /// alone
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;
        configure_connection(&conn).context("Failed to configure database connection")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.initialize()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        configure_connection(&conn).context("Failed to configure database connection")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(())
    }

    /// File backing this database, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection mutex poisoned"))
    }

    /// Run `f` inside one transaction, committing when it returns `Ok`
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let value = f(&tx)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }

    // ==================== Statistics ====================

    /// Get row counts of the cache tables
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> {
            conn.query_row(sql, [], |row| row.get(0))
                .with_context(|| format!("Failed to count rows: {}", sql))
        };

        Ok(DatabaseStats {
            changesets: count("SELECT COUNT(*) FROM changesets")?,
            changed_files: count("SELECT COUNT(*) FROM changedfiles")?,
            file_differences: count("SELECT COUNT(*) FROM changesetfiledifferences")?,
            changed_lines: count("SELECT COUNT(*) FROM changesetchangedlines")?,
            analysed_blocks: count(
                "SELECT COUNT(*) FROM changesetchangedlines WHERE analysis IS NOT NULL",
            )?,
            highlight_files: count("SELECT COUNT(*) FROM highlightfiles")?,
            highlighted_files: count("SELECT COUNT(*) FROM highlightfiles WHERE highlighted = 1")?,
            highlight_lines: count("SELECT COUNT(*) FROM highlightlines")?,
            code_contexts: count("SELECT COUNT(*) FROM codecontexts")?,
            errors: count("SELECT COUNT(*) FROM changeseterrors")?,
        })
    }
}
