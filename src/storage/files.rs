//! Repositories and interned file paths

use super::Database;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A registered git repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryRecord {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
}

impl Database {
    // ==================== Repositories ====================

    /// Register a repository under a unique name
    pub fn add_repository(&self, name: &str, path: &Path) -> Result<RepositoryRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO repositories (name, path) VALUES (?1, ?2)",
            params![name, path.to_string_lossy()],
        )
        .with_context(|| format!("Failed to add repository {}", name))?;

        Ok(RepositoryRecord {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            path: path.to_path_buf(),
        })
    }

    /// Get a repository by ID
    pub fn repository(&self, id: i64) -> Result<Option<RepositoryRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, path FROM repositories WHERE id = ?1",
            params![id],
            |row| {
                Ok(RepositoryRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    path: PathBuf::from(row.get::<_, String>(2)?),
                })
            },
        )
        .optional()
        .context("Failed to get repository")
    }

    /// Get a repository by name
    pub fn repository_by_name(&self, name: &str) -> Result<Option<RepositoryRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, path FROM repositories WHERE name = ?1",
            params![name],
            |row| {
                Ok(RepositoryRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    path: PathBuf::from(row.get::<_, String>(2)?),
                })
            },
        )
        .optional()
        .context("Failed to get repository")
    }

    // ==================== Files ====================

    /// Make sure every path has a file id; returns the ids of all `paths`
    pub fn ensure_paths(&self, paths: &[String]) -> Result<HashMap<String, i64>> {
        self.transaction(|tx| {
            let mut insert = tx.prepare_cached("INSERT OR IGNORE INTO files (path) VALUES (?1)")?;
            let mut select = tx.prepare_cached("SELECT id FROM files WHERE path = ?1")?;

            let mut ids = HashMap::with_capacity(paths.len());
            for path in paths {
                insert.execute(params![path])?;
                let id: i64 = select.query_row(params![path], |row| row.get(0))?;
                ids.insert(path.clone(), id);
            }
            Ok(ids)
        })
        .context("Failed to ensure file paths")
    }

    /// Look up the id of a path without creating it
    pub fn file_id(&self, path: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id FROM files WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get file id")
    }
}
