//! Changesets and their per-file content difference rows

use super::Database;
use crate::repo::ChangedFile;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Store the analysis of one block unless it has one already
pub const SET_ANALYSIS: &str = "UPDATE changesetchangedlines SET analysis = ?4 \
     WHERE changeset = ?1 AND file = ?2 AND block_index = ?3 AND analysis IS NULL";

/// A request to diff two commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Changeset {
    pub id: i64,
    pub repository: i64,
    pub from_commit: Option<String>,
    pub to_commit: String,
    pub for_merge: Option<String>,
    pub processed: bool,
    pub complete: bool,
}

impl Changeset {
    /// Primary changeset of a merge: first parent against the merge commit
    pub fn is_merge(&self) -> bool {
        self.for_merge.as_deref() == Some(self.to_commit.as_str())
    }

    /// Auxiliary changeset of a merge: merge base against the first parent
    pub fn is_merge_reference(&self) -> bool {
        self.for_merge.is_some() && !self.is_merge()
    }
}

/// What a consumer asks for when inserting a changeset
#[derive(Debug, Clone, Default)]
pub struct ChangesetRequest {
    pub repository: i64,
    pub from_commit: Option<String>,
    pub to_commit: String,
    pub for_merge: Option<String>,
    pub content: bool,
    pub highlight: bool,
}

/// A changed file joined with its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFileRow {
    pub file: i64,
    pub path: String,
    pub old_sha1: Option<String>,
    pub old_mode: Option<u32>,
    pub new_sha1: Option<String>,
    pub new_mode: Option<u32>,
}

/// One block of modified lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedLines {
    pub index: i64,
    /// Unchanged lines between the previous block (or file start) and this one
    pub offset: i64,
    pub delete_count: i64,
    pub delete_length: i64,
    pub insert_count: i64,
    pub insert_length: i64,
    pub analysis: Option<String>,
}

/// Per-file examination state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDifference {
    pub file: i64,
    pub comparison_pending: bool,
    pub old_is_binary: bool,
    pub new_is_binary: bool,
    pub old_length: Option<i64>,
    pub new_length: Option<i64>,
    pub old_linebreak: bool,
    pub new_linebreak: bool,
    pub old_highlightfile: Option<i64>,
    pub new_highlightfile: Option<i64>,
}

/// Result of examining one changed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Examination {
    pub difference: FileDifference,
    pub blocks: Vec<ChangedLines>,
}

/// Result of a line-level comparison of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparedFile {
    pub file: i64,
    pub old_linebreak: bool,
    pub new_linebreak: bool,
    pub blocks: Vec<ChangedLines>,
}

/// A permanent job failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangesetError {
    pub job_key: String,
    pub fatal: bool,
    pub traceback: String,
}

/// Cache flags of a changeset as seen by a consumer
#[derive(Debug, Clone, Serialize)]
pub struct ChangesetStatus {
    pub changeset: Changeset,
    pub content_complete: Option<bool>,
    pub highlight_requested: bool,
    pub highlight_evaluated: Option<bool>,
    pub unhighlighted_files: i64,
    pub changed_files: i64,
    pub blocks: i64,
    pub errors: Vec<ChangesetError>,
}

fn changeset_from_row(row: &Row<'_>) -> rusqlite::Result<Changeset> {
    Ok(Changeset {
        id: row.get(0)?,
        repository: row.get(1)?,
        from_commit: row.get(2)?,
        to_commit: row.get(3)?,
        for_merge: row.get(4)?,
        processed: row.get(5)?,
        complete: row.get(6)?,
    })
}

fn changed_file_from_row(row: &Row<'_>) -> rusqlite::Result<ChangedFileRow> {
    Ok(ChangedFileRow {
        file: row.get(0)?,
        path: row.get(1)?,
        old_sha1: row.get(2)?,
        old_mode: row.get(3)?,
        new_sha1: row.get(4)?,
        new_mode: row.get(5)?,
    })
}

fn changed_lines_from_row(row: &Row<'_>) -> rusqlite::Result<ChangedLines> {
    Ok(ChangedLines {
        index: row.get(0)?,
        offset: row.get(1)?,
        delete_count: row.get(2)?,
        delete_length: row.get(3)?,
        insert_count: row.get(4)?,
        insert_length: row.get(5)?,
        analysis: row.get(6)?,
    })
}

const CHANGESET_COLUMNS: &str =
    "id, repository, from_commit, to_commit, for_merge, processed, complete";

const CHANGED_FILE_COLUMNS: &str =
    "cf.file, f.path, cf.old_sha1, cf.old_mode, cf.new_sha1, cf.new_mode";

const INSERT_CHANGED_LINES: &str = "INSERT OR IGNORE INTO changesetchangedlines \
     (changeset, file, block_index, line_offset, delete_count, delete_length, \
      insert_count, insert_length, analysis) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

impl Database {
    // ==================== Changesets ====================

    /// Insert a changeset request, or find the existing one, and attach the
    /// requested content difference and highlighting rows
    pub fn request_changeset(&self, request: &ChangesetRequest) -> Result<i64> {
        let content = request.content || request.highlight;

        self.transaction(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO changesets (repository, from_commit, to_commit, for_merge) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    request.repository,
                    request.from_commit,
                    request.to_commit,
                    request.for_merge
                ],
            )?;

            let id: i64 = tx.query_row(
                "SELECT id FROM changesets \
                 WHERE repository = ?1 AND COALESCE(from_commit, '') = COALESCE(?2, '') \
                   AND to_commit = ?3 AND COALESCE(for_merge, '') = COALESCE(?4, '')",
                params![
                    request.repository,
                    request.from_commit,
                    request.to_commit,
                    request.for_merge
                ],
                |row| row.get(0),
            )?;

            if content {
                tx.execute(
                    "INSERT OR IGNORE INTO changesetcontentdifferences (changeset) VALUES (?1)",
                    params![id],
                )?;
            }

            if request.highlight {
                tx.execute(
                    "INSERT INTO changesethighlightrequests (changeset, requested) VALUES (?1, 1) \
                     ON CONFLICT(changeset) DO UPDATE SET requested = 1",
                    params![id],
                )?;
            }

            Ok(id)
        })
        .context("Failed to request changeset")
    }

    /// Get a changeset by ID
    pub fn changeset(&self, id: i64) -> Result<Option<Changeset>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM changesets WHERE id = ?1", CHANGESET_COLUMNS),
            params![id],
            changeset_from_row,
        )
        .optional()
        .context("Failed to get changeset")
    }

    /// Find the reference changeset belonging to a merge changeset
    pub fn merge_reference(&self, primary: &Changeset) -> Result<Option<Changeset>> {
        let (Some(for_merge), Some(first_parent)) = (&primary.for_merge, &primary.from_commit)
        else {
            return Ok(None);
        };

        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM changesets \
                 WHERE repository = ?1 AND for_merge = ?2 AND to_commit = ?3 AND to_commit != for_merge \
                 ORDER BY id LIMIT 1",
                CHANGESET_COLUMNS
            ),
            params![primary.repository, for_merge, first_parent],
            changeset_from_row,
        )
        .optional()
        .context("Failed to get merge reference changeset")
    }

    /// Changesets whose persisted state still requires work
    ///
    /// Merge reference changesets are handled by the group of their primary
    /// and never returned. Changesets whose structure, or whose merge
    /// reference's structure, could not be computed are left alone.
    pub fn pending_changesets(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.id FROM changesets c
            LEFT JOIN changesetcontentdifferences cd ON cd.changeset = c.id
            LEFT JOIN changesethighlightrequests hr ON hr.changeset = c.id
            WHERE (c.for_merge IS NULL OR c.for_merge = c.to_commit)
              AND NOT EXISTS (
                  SELECT 1 FROM changeseterrors e
                  WHERE e.changeset = c.id AND e.fatal = 1
                    AND e.job_key LIKE 'CalculateStructureDifference:%')
              AND NOT EXISTS (
                  SELECT 1 FROM changesets r
                  JOIN changeseterrors e ON e.changeset = r.id
                  WHERE c.for_merge = c.to_commit
                    AND r.repository = c.repository AND r.for_merge = c.to_commit
                    AND r.to_commit != r.for_merge AND e.fatal = 1
                    AND e.job_key LIKE 'CalculateStructureDifference:%')
              AND (c.processed = 0
                   OR c.complete = 0
                   OR cd.complete = 0
                   OR (c.for_merge = c.to_commit AND EXISTS (
                       SELECT 1 FROM changesets r
                       JOIN changesetcontentdifferences rcd ON rcd.changeset = r.id
                       WHERE r.repository = c.repository AND r.for_merge = c.to_commit
                         AND r.to_commit != r.for_merge AND rcd.complete = 0))
                   OR (hr.requested = 1 AND (hr.evaluated = 0 OR EXISTS (
                       SELECT 1 FROM changesetfiledifferences fd
                       JOIN highlightfiles hf
                         ON hf.id = fd.old_highlightfile OR hf.id = fd.new_highlightfile
                       WHERE fd.changeset = c.id AND hf.highlighted = 0
                         -- a highlight that failed for good is not retried
                         AND NOT EXISTS (
                             SELECT 1 FROM changeseterrors e
                             WHERE e.changeset = c.id
                               AND e.job_key = 'SyntaxHighlightFile::' || hf.repository || ':'
                                   || hf.sha1 || ':' || hf.language || ':' || hf.conflicts)))))
            ORDER BY c.id
            "#,
        )?;

        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Persist the structure difference: changed files, `processed`, and
    /// `complete` unless the changeset waits for merge pruning
    pub fn store_structure(
        &self,
        changeset: i64,
        files: &[(i64, ChangedFile)],
        complete: bool,
    ) -> Result<()> {
        self.transaction(|tx| {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO changedfiles \
                 (changeset, file, old_sha1, old_mode, new_sha1, new_mode) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (file, change) in files {
                insert.execute(params![
                    changeset,
                    file,
                    change.old_sha1,
                    change.old_mode,
                    change.new_sha1,
                    change.new_mode
                ])?;
            }

            tx.execute(
                "UPDATE changesets SET processed = 1, complete = MAX(complete, ?2) WHERE id = ?1",
                params![changeset, complete],
            )?;
            Ok(())
        })
        .with_context(|| format!("Failed to store structure of changeset {}", changeset))
    }

    /// Reduce a merge pair to the files changed on both sides and mark both
    /// changesets complete
    pub fn prune_merge(&self, primary: i64, reference: i64) -> Result<()> {
        self.transaction(|tx| {
            for (this, other) in [(primary, reference), (reference, primary)] {
                tx.execute(
                    "DELETE FROM changedfiles WHERE changeset = ?1 \
                     AND file NOT IN (SELECT file FROM changedfiles WHERE changeset = ?2)",
                    params![this, other],
                )?;
            }
            tx.execute(
                "UPDATE changesets SET complete = 1 WHERE id IN (?1, ?2)",
                params![primary, reference],
            )?;
            Ok(())
        })
        .with_context(|| format!("Failed to prune merge changeset {}", primary))
    }

    // ==================== Changed Files ====================

    /// All changed files of a changeset
    pub fn changed_files(&self, changeset: i64) -> Result<Vec<ChangedFileRow>> {
        self.query_changed_files(
            &format!(
                "SELECT {} FROM changedfiles cf JOIN files f ON f.id = cf.file \
                 WHERE cf.changeset = ?1 ORDER BY cf.file",
                CHANGED_FILE_COLUMNS
            ),
            changeset,
        )
    }

    /// Changed files that have not been examined yet
    pub fn unexamined_files(&self, changeset: i64) -> Result<Vec<ChangedFileRow>> {
        self.query_changed_files(
            &format!(
                "SELECT {} FROM changedfiles cf JOIN files f ON f.id = cf.file \
                 LEFT JOIN changesetfiledifferences fd \
                   ON fd.changeset = cf.changeset AND fd.file = cf.file \
                 WHERE cf.changeset = ?1 AND fd.file IS NULL ORDER BY cf.file",
                CHANGED_FILE_COLUMNS
            ),
            changeset,
        )
    }

    /// Changed files still waiting for a line-level comparison
    pub fn pending_comparisons(&self, changeset: i64) -> Result<Vec<ChangedFileRow>> {
        self.query_changed_files(
            &format!(
                "SELECT {} FROM changedfiles cf JOIN files f ON f.id = cf.file \
                 JOIN changesetfiledifferences fd \
                   ON fd.changeset = cf.changeset AND fd.file = cf.file \
                 WHERE cf.changeset = ?1 AND fd.comparison_pending = 1 ORDER BY cf.file",
                CHANGED_FILE_COLUMNS
            ),
            changeset,
        )
    }

    /// Changed files with at least one block missing its analysis
    pub fn files_with_unanalyzed_blocks(&self, changeset: i64) -> Result<Vec<ChangedFileRow>> {
        self.query_changed_files(
            &format!(
                "SELECT {} FROM changedfiles cf JOIN files f ON f.id = cf.file \
                 WHERE cf.changeset = ?1 AND EXISTS ( \
                     SELECT 1 FROM changesetchangedlines cl \
                     WHERE cl.changeset = cf.changeset AND cl.file = cf.file \
                       AND cl.analysis IS NULL) \
                 ORDER BY cf.file",
                CHANGED_FILE_COLUMNS
            ),
            changeset,
        )
    }

    fn query_changed_files(&self, sql: &str, changeset: i64) -> Result<Vec<ChangedFileRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![changeset], changed_file_from_row)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read changed file")?);
        }
        Ok(files)
    }

    // ==================== Content Differences ====================

    /// `Some(complete)` when content difference was requested
    pub fn content_difference(&self, changeset: i64) -> Result<Option<bool>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT complete FROM changesetcontentdifferences WHERE changeset = ?1",
            params![changeset],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get content difference")
    }

    /// Mark the content difference complete; returns true on the transition
    pub fn set_content_complete(&self, changeset: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE changesetcontentdifferences SET complete = 1 \
                 WHERE changeset = ?1 AND complete = 0",
                params![changeset],
            )
            .context("Failed to complete content difference")?;
        Ok(changed > 0)
    }

    /// Persist examination results
    pub fn store_examination(&self, changeset: i64, results: &[Examination]) -> Result<()> {
        self.transaction(|tx| {
            let mut insert_difference = tx.prepare_cached(
                "INSERT OR IGNORE INTO changesetfiledifferences \
                 (changeset, file, comparison_pending, old_is_binary, new_is_binary, \
                  old_length, new_length, old_linebreak, new_linebreak) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            let mut insert_lines = tx.prepare_cached(INSERT_CHANGED_LINES)?;

            for result in results {
                let d = &result.difference;
                let inserted = insert_difference.execute(params![
                    changeset,
                    d.file,
                    d.comparison_pending,
                    d.old_is_binary,
                    d.new_is_binary,
                    d.old_length,
                    d.new_length,
                    d.old_linebreak,
                    d.new_linebreak
                ])?;
                if inserted == 0 {
                    continue;
                }
                for block in &result.blocks {
                    insert_lines.execute(params![
                        changeset,
                        d.file,
                        block.index,
                        block.offset,
                        block.delete_count,
                        block.delete_length,
                        block.insert_count,
                        block.insert_length,
                        block.analysis
                    ])?;
                }
            }
            Ok(())
        })
        .with_context(|| format!("Failed to store examination of changeset {}", changeset))
    }

    /// Persist line-level comparisons; a file whose comparison is no longer
    /// pending is left untouched
    pub fn store_file_differences(&self, changeset: i64, results: &[ComparedFile]) -> Result<()> {
        self.transaction(|tx| {
            let mut finish = tx.prepare_cached(
                "UPDATE changesetfiledifferences \
                 SET comparison_pending = 0, old_linebreak = ?3, new_linebreak = ?4 \
                 WHERE changeset = ?1 AND file = ?2 AND comparison_pending = 1",
            )?;
            let mut insert_lines = tx.prepare_cached(INSERT_CHANGED_LINES)?;

            for result in results {
                let updated = finish.execute(params![
                    changeset,
                    result.file,
                    result.old_linebreak,
                    result.new_linebreak
                ])?;
                if updated == 0 {
                    continue;
                }
                for block in &result.blocks {
                    insert_lines.execute(params![
                        changeset,
                        result.file,
                        block.index,
                        block.offset,
                        block.delete_count,
                        block.delete_length,
                        block.insert_count,
                        block.insert_length,
                        block.analysis
                    ])?;
                }
            }
            Ok(())
        })
        .with_context(|| format!("Failed to store file differences of changeset {}", changeset))
    }

    /// Examination state of every examined file
    pub fn file_differences(&self, changeset: i64) -> Result<Vec<FileDifference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT file, comparison_pending, old_is_binary, new_is_binary, old_length, \
                    new_length, old_linebreak, new_linebreak, old_highlightfile, new_highlightfile \
             FROM changesetfiledifferences WHERE changeset = ?1 ORDER BY file",
        )?;
        let rows = stmt.query_map(params![changeset], |row| {
            Ok(FileDifference {
                file: row.get(0)?,
                comparison_pending: row.get(1)?,
                old_is_binary: row.get(2)?,
                new_is_binary: row.get(3)?,
                old_length: row.get(4)?,
                new_length: row.get(5)?,
                old_linebreak: row.get(6)?,
                new_linebreak: row.get(7)?,
                old_highlightfile: row.get(8)?,
                new_highlightfile: row.get(9)?,
            })
        })?;

        let mut differences = Vec::new();
        for row in rows {
            differences.push(row?);
        }
        Ok(differences)
    }

    /// Blocks of one file in index order
    pub fn changed_lines(&self, changeset: i64, file: i64) -> Result<Vec<ChangedLines>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT block_index, line_offset, delete_count, delete_length, insert_count, \
                    insert_length, analysis \
             FROM changesetchangedlines WHERE changeset = ?1 AND file = ?2 \
             ORDER BY block_index",
        )?;
        let rows = stmt.query_map(params![changeset, file], changed_lines_from_row)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    // ==================== Errors ====================

    /// Record a permanent job failure; the first record for a key wins
    pub fn record_error(
        &self,
        changeset: i64,
        job_key: &str,
        fatal: bool,
        traceback: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO changeseterrors (changeset, job_key, fatal, traceback) \
             VALUES (?1, ?2, ?3, ?4)",
            params![changeset, job_key, fatal, traceback],
        )
        .context("Failed to record changeset error")?;
        Ok(())
    }

    /// All permanent failures of a changeset
    pub fn changeset_errors(&self, changeset: i64) -> Result<Vec<ChangesetError>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT job_key, fatal, traceback FROM changeseterrors \
             WHERE changeset = ?1 ORDER BY job_key",
        )?;
        let rows = stmt.query_map(params![changeset], |row| {
            Ok(ChangesetError {
                job_key: row.get(0)?,
                fatal: row.get(1)?,
                traceback: row.get(2)?,
            })
        })?;

        let mut errors = Vec::new();
        for row in rows {
            errors.push(row?);
        }
        Ok(errors)
    }

    /// Keys of jobs that failed permanently for a changeset
    pub fn failed_job_keys(&self, changeset: i64) -> Result<HashSet<String>> {
        Ok(self
            .changeset_errors(changeset)?
            .into_iter()
            .map(|e| e.job_key)
            .collect())
    }

    // ==================== Status ====================

    /// Everything a consumer can observe about a changeset
    pub fn changeset_status(&self, id: i64) -> Result<Option<ChangesetStatus>> {
        let Some(changeset) = self.changeset(id)? else {
            return Ok(None);
        };
        let content_complete = self.content_difference(id)?;
        let highlight = self.highlight_request(id)?;
        let errors = self.changeset_errors(id)?;

        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> {
            conn.query_row(sql, params![id], |row| row.get(0))
                .with_context(|| format!("Failed to count rows: {}", sql))
        };

        Ok(Some(ChangesetStatus {
            content_complete,
            highlight_requested: highlight.map(|h| h.requested).unwrap_or(false),
            highlight_evaluated: highlight.map(|h| h.evaluated),
            unhighlighted_files: count(
                "SELECT COUNT(DISTINCT hf.id) FROM changesetfiledifferences fd \
                 JOIN highlightfiles hf \
                   ON hf.id = fd.old_highlightfile OR hf.id = fd.new_highlightfile \
                 WHERE fd.changeset = ?1 AND hf.highlighted = 0",
            )?,
            changed_files: count("SELECT COUNT(*) FROM changedfiles WHERE changeset = ?1")?,
            blocks: count("SELECT COUNT(*) FROM changesetchangedlines WHERE changeset = ?1")?,
            errors,
            changeset,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("critic", Path::new("/git/critic.git")).unwrap();
        (db, repo.id)
    }

    fn change(path: &str, old: Option<&str>, new: Option<&str>) -> ChangedFile {
        ChangedFile {
            path: path.to_string(),
            old_sha1: old.map(str::to_string),
            old_mode: old.map(|_| 0o100644),
            new_sha1: new.map(str::to_string),
            new_mode: new.map(|_| 0o100644),
        }
    }

    #[test]
    fn test_request_changeset_is_idempotent() {
        let (db, repo) = setup();
        let request = ChangesetRequest {
            repository: repo,
            from_commit: None,
            to_commit: "b".repeat(40),
            content: true,
            ..Default::default()
        };

        let first = db.request_changeset(&request).unwrap();
        let second = db.request_changeset(&request).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.content_difference(first).unwrap(), Some(false));
        assert!(db.highlight_request(first).unwrap().is_none());

        let highlighted = db
            .request_changeset(&ChangesetRequest {
                highlight: true,
                ..request
            })
            .unwrap();
        assert_eq!(highlighted, first);
        assert!(db.highlight_request(first).unwrap().unwrap().requested);
    }

    #[test]
    fn test_structure_flags_are_monotone() {
        let (db, repo) = setup();
        let id = db
            .request_changeset(&ChangesetRequest {
                repository: repo,
                from_commit: Some("a".repeat(40)),
                to_commit: "b".repeat(40),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(db.pending_changesets().unwrap(), vec![id]);

        let ids = db.ensure_paths(&["f".to_string()]).unwrap();
        let files = vec![(ids["f"], change("f", Some("1"), Some("2")))];

        db.store_structure(id, &files, true).unwrap();
        let changeset = db.changeset(id).unwrap().unwrap();
        assert!(changeset.processed && changeset.complete);

        db.store_structure(id, &files, false).unwrap();
        let changeset = db.changeset(id).unwrap().unwrap();
        assert!(changeset.complete);
        assert_eq!(db.changed_files(id).unwrap().len(), 1);
        assert!(db.pending_changesets().unwrap().is_empty());
    }

    #[test]
    fn test_prune_merge_keeps_common_files() {
        let (db, repo) = setup();
        let merge = "m".repeat(40);
        let primary = db
            .request_changeset(&ChangesetRequest {
                repository: repo,
                from_commit: Some("p".repeat(40)),
                to_commit: merge.clone(),
                for_merge: Some(merge.clone()),
                ..Default::default()
            })
            .unwrap();
        let reference = db
            .request_changeset(&ChangesetRequest {
                repository: repo,
                from_commit: Some("b".repeat(40)),
                to_commit: "p".repeat(40),
                for_merge: Some(merge.clone()),
                ..Default::default()
            })
            .unwrap();

        let primary_row = db.changeset(primary).unwrap().unwrap();
        assert!(primary_row.is_merge());
        assert_eq!(db.merge_reference(&primary_row).unwrap().unwrap().id, reference);
        assert_eq!(db.pending_changesets().unwrap(), vec![primary]);

        let ids = db
            .ensure_paths(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        db.store_structure(
            primary,
            &[
                (ids["a"], change("a", Some("1"), Some("2"))),
                (ids["b"], change("b", Some("1"), Some("2"))),
            ],
            false,
        )
        .unwrap();
        db.store_structure(
            reference,
            &[
                (ids["b"], change("b", Some("0"), Some("1"))),
                (ids["c"], change("c", Some("0"), Some("1"))),
            ],
            false,
        )
        .unwrap();
        assert!(!db.changeset(primary).unwrap().unwrap().complete);

        db.prune_merge(primary, reference).unwrap();
        let remaining: Vec<String> = db
            .changed_files(primary)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(remaining, vec!["b"]);
        assert_eq!(db.changed_files(reference).unwrap().len(), 1);
        assert!(db.changeset(reference).unwrap().unwrap().complete);
        assert!(db.pending_changesets().unwrap().is_empty());
    }

    #[test]
    fn test_file_difference_stored_once() {
        let (db, repo) = setup();
        let id = db
            .request_changeset(&ChangesetRequest {
                repository: repo,
                to_commit: "b".repeat(40),
                content: true,
                ..Default::default()
            })
            .unwrap();
        let ids = db.ensure_paths(&["f".to_string()]).unwrap();
        let file = ids["f"];
        db.store_structure(id, &[(file, change("f", Some("1"), Some("2")))], true)
            .unwrap();

        assert_eq!(db.unexamined_files(id).unwrap().len(), 1);
        db.store_examination(
            id,
            &[Examination {
                difference: FileDifference {
                    file,
                    comparison_pending: true,
                    old_length: Some(3),
                    new_length: Some(4),
                    ..Default::default()
                },
                blocks: vec![],
            }],
        )
        .unwrap();
        assert!(db.unexamined_files(id).unwrap().is_empty());
        assert_eq!(db.pending_comparisons(id).unwrap().len(), 1);

        let compared = ComparedFile {
            file,
            old_linebreak: true,
            new_linebreak: true,
            blocks: vec![ChangedLines {
                index: 0,
                offset: 1,
                delete_count: 1,
                delete_length: 1,
                insert_count: 2,
                insert_length: 2,
                analysis: None,
            }],
        };
        db.store_file_differences(id, &[compared.clone()]).unwrap();

        let mut rerun = compared;
        rerun.blocks[0].offset = 7;
        db.store_file_differences(id, &[rerun]).unwrap();

        let blocks = db.changed_lines(id, file).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 1);
        assert!(db.pending_comparisons(id).unwrap().is_empty());
        assert_eq!(db.files_with_unanalyzed_blocks(id).unwrap().len(), 1);

        let conn = db.conn().unwrap();
        conn.execute(SET_ANALYSIS, params![id, file, 0, "0=0"]).unwrap();
        conn.execute(SET_ANALYSIS, params![id, file, 0, "0=1"]).unwrap();
        drop(conn);
        assert_eq!(
            db.changed_lines(id, file).unwrap()[0].analysis.as_deref(),
            Some("0=0")
        );
    }

    #[test]
    fn test_errors_are_permanent() {
        let (db, repo) = setup();
        let id = db
            .request_changeset(&ChangesetRequest {
                repository: repo,
                to_commit: "b".repeat(40),
                ..Default::default()
            })
            .unwrap();

        db.record_error(id, "CalculateStructureDifference:1:1", true, "bad range")
            .unwrap();
        db.record_error(id, "CalculateStructureDifference:1:1", false, "again")
            .unwrap();

        let errors = db.changeset_errors(id).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].fatal);
        assert!(db
            .failed_job_keys(id)
            .unwrap()
            .contains("CalculateStructureDifference:1:1"));
        assert!(db.pending_changesets().unwrap().is_empty());
    }
}
