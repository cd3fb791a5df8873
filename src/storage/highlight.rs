//! Highlight languages, content-addressed highlight files and code contexts

use super::{Database, Side};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

/// Store one packed line of a highlight file
pub const INSERT_HIGHLIGHT_LINE: &str =
    "INSERT OR IGNORE INTO highlightlines (file, line, data) VALUES (?1, ?2, ?3)";

/// Store one structural context label
pub const INSERT_CODE_CONTEXT: &str = "INSERT OR IGNORE INTO codecontexts \
     (sha1, language, first_line, last_line, context) VALUES (?1, ?2, ?3, ?4, ?5)";

/// Mark a highlight file complete once all its lines are written
pub const MARK_HIGHLIGHTED: &str =
    "UPDATE highlightfiles SET highlighted = 1, requested = 0 WHERE id = ?1";

/// A content-addressed highlight artefact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighlightFile {
    pub id: i64,
    pub repository: i64,
    pub sha1: String,
    pub language: i64,
    pub conflicts: bool,
    pub highlighted: bool,
    pub requested: bool,
}

/// Highlighting state of one changeset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HighlightRequestState {
    pub requested: bool,
    pub evaluated: bool,
}

/// Attach a highlight file to one side of a file difference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightLink {
    pub file: i64,
    pub side: Side,
    pub highlight_file: i64,
}

/// A text file version that has no highlight file linked yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkedVersion {
    pub file: i64,
    pub path: String,
    pub side: Side,
    pub sha1: String,
}

/// A structural context label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeContextRow {
    pub first_line: i64,
    pub last_line: i64,
    pub context: String,
}

fn highlight_file_from_row(row: &Row<'_>) -> rusqlite::Result<HighlightFile> {
    Ok(HighlightFile {
        id: row.get(0)?,
        repository: row.get(1)?,
        sha1: row.get(2)?,
        language: row.get(3)?,
        conflicts: row.get(4)?,
        highlighted: row.get(5)?,
        requested: row.get(6)?,
    })
}

const HIGHLIGHT_FILE_COLUMNS: &str =
    "hf.id, hf.repository, hf.sha1, hf.language, hf.conflicts, hf.highlighted, hf.requested";

impl Database {
    // ==================== Languages ====================

    /// Intern a language label
    pub fn language_id(&self, label: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO highlightlanguages (label) VALUES (?1)",
            params![label],
        )
        .context("Failed to intern highlight language")?;
        conn.query_row(
            "SELECT id FROM highlightlanguages WHERE label = ?1",
            params![label],
            |row| row.get(0),
        )
        .context("Failed to get highlight language")
    }

    /// Label of an interned language
    pub fn language_label(&self, id: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT label FROM highlightlanguages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get highlight language label")
    }

    // ==================== Highlight Files ====================

    /// Find the highlight file for a content address, creating it if needed
    pub fn find_or_insert_highlight_file(
        &self,
        repository: i64,
        sha1: &str,
        language: i64,
        conflicts: bool,
    ) -> Result<HighlightFile> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO highlightfiles (repository, sha1, language, conflicts) \
             VALUES (?1, ?2, ?3, ?4)",
            params![repository, sha1, language, conflicts],
        )
        .context("Failed to insert highlight file")?;
        conn.query_row(
            &format!(
                "SELECT {} FROM highlightfiles hf \
                 WHERE repository = ?1 AND sha1 = ?2 AND language = ?3 AND conflicts = ?4",
                HIGHLIGHT_FILE_COLUMNS
            ),
            params![repository, sha1, language, conflicts],
            highlight_file_from_row,
        )
        .context("Failed to get highlight file")
    }

    /// Custom highlight request: mark the artefact as wanted
    pub fn request_highlight(
        &self,
        repository: i64,
        sha1: &str,
        language: &str,
        conflicts: bool,
    ) -> Result<i64> {
        let language = self.language_id(language)?;
        let file = self.find_or_insert_highlight_file(repository, sha1, language, conflicts)?;

        let conn = self.conn()?;
        conn.execute(
            "UPDATE highlightfiles SET requested = 1 WHERE id = ?1 AND highlighted = 0",
            params![file.id],
        )
        .context("Failed to request highlight")?;
        Ok(file.id)
    }

    /// Get a highlight file by ID
    pub fn highlight_file(&self, id: i64) -> Result<Option<HighlightFile>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM highlightfiles hf WHERE id = ?1", HIGHLIGHT_FILE_COLUMNS),
            params![id],
            highlight_file_from_row,
        )
        .optional()
        .context("Failed to get highlight file")
    }

    /// Custom highlight requests that are not satisfied yet
    pub fn requested_highlight_files(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM highlightfiles WHERE requested = 1 AND highlighted = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Give up on a custom highlight request
    pub fn clear_highlight_request(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE highlightfiles SET requested = 0 WHERE id = ?1",
            params![id],
        )
        .context("Failed to clear highlight request")?;
        Ok(())
    }

    /// Packed token lines of a highlight file in line order
    pub fn highlight_lines(&self, id: i64) -> Result<Vec<(i64, Vec<u8>)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT line, data FROM highlightlines WHERE file = ?1 ORDER BY line")?;
        let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut lines = Vec::new();
        for row in rows {
            lines.push(row?);
        }
        Ok(lines)
    }

    /// Context labels of a file version
    pub fn code_contexts(&self, sha1: &str, language: i64) -> Result<Vec<CodeContextRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT first_line, last_line, context FROM codecontexts \
             WHERE sha1 = ?1 AND language = ?2 ORDER BY first_line, last_line",
        )?;
        let rows = stmt.query_map(params![sha1, language], |row| {
            Ok(CodeContextRow {
                first_line: row.get(0)?,
                last_line: row.get(1)?,
                context: row.get(2)?,
            })
        })?;

        let mut contexts = Vec::new();
        for row in rows {
            contexts.push(row?);
        }
        Ok(contexts)
    }

    // ==================== Changeset Highlighting ====================

    /// Highlighting state of a changeset, `None` when never requested
    pub fn highlight_request(&self, changeset: i64) -> Result<Option<HighlightRequestState>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT requested, evaluated FROM changesethighlightrequests WHERE changeset = ?1",
            params![changeset],
            |row| {
                Ok(HighlightRequestState {
                    requested: row.get(0)?,
                    evaluated: row.get(1)?,
                })
            },
        )
        .optional()
        .context("Failed to get highlight request")
    }

    /// Mark languages determined for every file; returns true on the transition
    pub fn set_highlight_evaluated(&self, changeset: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE changesethighlightrequests SET evaluated = 1 \
                 WHERE changeset = ?1 AND evaluated = 0",
                params![changeset],
            )
            .context("Failed to mark highlighting evaluated")?;
        Ok(changed > 0)
    }

    /// Link highlight files into file differences; existing links are kept
    pub fn link_highlight_files(&self, changeset: i64, links: &[HighlightLink]) -> Result<()> {
        self.transaction(|tx| {
            let mut link_old = tx.prepare_cached(
                "UPDATE changesetfiledifferences SET old_highlightfile = ?3 \
                 WHERE changeset = ?1 AND file = ?2 AND old_highlightfile IS NULL",
            )?;
            let mut link_new = tx.prepare_cached(
                "UPDATE changesetfiledifferences SET new_highlightfile = ?3 \
                 WHERE changeset = ?1 AND file = ?2 AND new_highlightfile IS NULL",
            )?;
            for link in links {
                let stmt = match link.side {
                    Side::Old => &mut link_old,
                    Side::New => &mut link_new,
                };
                stmt.execute(params![changeset, link.file, link.highlight_file])?;
            }
            Ok(())
        })
        .with_context(|| format!("Failed to link highlight files of changeset {}", changeset))
    }

    /// Examined text versions with no highlight file linked
    pub fn unlinked_versions(&self, changeset: i64) -> Result<Vec<UnlinkedVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT fd.file, f.path, 'old', cf.old_sha1 \
             FROM changesetfiledifferences fd \
             JOIN changedfiles cf ON cf.changeset = fd.changeset AND cf.file = fd.file \
             JOIN files f ON f.id = fd.file \
             WHERE fd.changeset = ?1 AND cf.old_sha1 IS NOT NULL \
               AND fd.old_is_binary = 0 AND fd.old_highlightfile IS NULL \
               AND cf.old_sha1 != COALESCE(cf.new_sha1, '') \
             UNION ALL \
             SELECT fd.file, f.path, 'new', cf.new_sha1 \
             FROM changesetfiledifferences fd \
             JOIN changedfiles cf ON cf.changeset = fd.changeset AND cf.file = fd.file \
             JOIN files f ON f.id = fd.file \
             WHERE fd.changeset = ?1 AND cf.new_sha1 IS NOT NULL \
               AND fd.new_is_binary = 0 AND fd.new_highlightfile IS NULL \
               AND cf.new_sha1 != COALESCE(cf.old_sha1, '') \
             ORDER BY 1, 3 DESC",
        )?;
        let rows = stmt.query_map(params![changeset], |row| {
            let side: String = row.get(2)?;
            Ok(UnlinkedVersion {
                file: row.get(0)?,
                path: row.get(1)?,
                side: if side == "old" { Side::Old } else { Side::New },
                sha1: row.get(3)?,
            })
        })?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }

    /// Distinct highlight files referenced by a changeset that are not done
    pub fn unhighlighted_files(&self, changeset: i64) -> Result<Vec<HighlightFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT {} FROM changesetfiledifferences fd \
             JOIN highlightfiles hf ON hf.id = fd.old_highlightfile OR hf.id = fd.new_highlightfile \
             WHERE fd.changeset = ?1 AND hf.highlighted = 0 ORDER BY hf.id",
            HIGHLIGHT_FILE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![changeset], highlight_file_from_row)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChangesetRequest, Examination, FileDifference};
    use std::path::Path;

    #[test]
    fn test_highlight_file_is_content_addressed() {
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("r", Path::new("/r")).unwrap().id;
        let rust = db.language_id("rust").unwrap();
        assert_eq!(db.language_id("rust").unwrap(), rust);
        assert_eq!(db.language_label(rust).unwrap().as_deref(), Some("rust"));

        let a = db.find_or_insert_highlight_file(repo, "abc", rust, false).unwrap();
        let b = db.find_or_insert_highlight_file(repo, "abc", rust, false).unwrap();
        let c = db.find_or_insert_highlight_file(repo, "abc", rust, true).unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(!a.highlighted && !a.requested);
    }

    #[test]
    fn test_custom_request_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("r", Path::new("/r")).unwrap().id;

        let id = db.request_highlight(repo, "abc", "python", false).unwrap();
        assert_eq!(db.requested_highlight_files().unwrap(), vec![id]);

        db.conn().unwrap().execute(MARK_HIGHLIGHTED, params![id]).unwrap();
        let file = db.highlight_file(id).unwrap().unwrap();
        assert!(file.highlighted && !file.requested);
        assert!(db.requested_highlight_files().unwrap().is_empty());

        // A satisfied artefact is not requested again
        db.request_highlight(repo, "abc", "python", false).unwrap();
        assert!(db.requested_highlight_files().unwrap().is_empty());
    }

    #[test]
    fn test_links_and_unlinked_versions() {
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("r", Path::new("/r")).unwrap().id;
        let changeset = db
            .request_changeset(&ChangesetRequest {
                repository: repo,
                to_commit: "b".repeat(40),
                highlight: true,
                ..Default::default()
            })
            .unwrap();
        let ids = db.ensure_paths(&["lib.rs".to_string()]).unwrap();
        let file = ids["lib.rs"];
        db.store_structure(
            changeset,
            &[(
                file,
                crate::repo::ChangedFile {
                    path: "lib.rs".to_string(),
                    old_sha1: Some("1".repeat(40)),
                    old_mode: Some(0o100644),
                    new_sha1: Some("2".repeat(40)),
                    new_mode: Some(0o100644),
                },
            )],
            true,
        )
        .unwrap();
        db.store_examination(
            changeset,
            &[Examination {
                difference: FileDifference {
                    file,
                    comparison_pending: true,
                    ..Default::default()
                },
                blocks: vec![],
            }],
        )
        .unwrap();

        let unlinked = db.unlinked_versions(changeset).unwrap();
        assert_eq!(unlinked.len(), 2);
        assert_eq!(unlinked[0].side, Side::Old);

        let rust = db.language_id("rust").unwrap();
        let hf = db
            .find_or_insert_highlight_file(repo, &"2".repeat(40), rust, false)
            .unwrap();
        db.link_highlight_files(
            changeset,
            &[HighlightLink {
                file,
                side: Side::New,
                highlight_file: hf.id,
            }],
        )
        .unwrap();

        let unlinked = db.unlinked_versions(changeset).unwrap();
        assert_eq!(unlinked.len(), 1);
        assert_eq!(unlinked[0].side, Side::Old);
        assert_eq!(db.unhighlighted_files(changeset).unwrap(), vec![hf.clone()]);

        assert!(db.set_highlight_evaluated(changeset).unwrap());
        assert!(!db.set_highlight_evaluated(changeset).unwrap());
        assert!(db.highlight_request(changeset).unwrap().unwrap().evaluated);
    }
}
