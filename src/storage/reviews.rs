//! Review branches, branch updates and review events

use super::Database;
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// A tracked branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub id: i64,
    pub repository: i64,
    pub name: String,
    pub head: Option<String>,
}

/// A recorded move of a branch head
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchUpdate {
    pub id: i64,
    pub branch: i64,
    pub repository: i64,
    pub review: Option<i64>,
    pub from_head: Option<String>,
    pub to_head: String,
}

/// A queued review notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewEvent {
    pub id: i64,
    pub review: i64,
    pub branchupdate: i64,
    pub processed: bool,
    pub summary: Option<String>,
}

impl Database {
    // ==================== Branches ====================

    /// Find or create a branch
    pub fn ensure_branch(&self, repository: i64, name: &str) -> Result<Branch> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO branches (repository, name) VALUES (?1, ?2)",
            params![repository, name],
        )
        .context("Failed to create branch")?;
        conn.query_row(
            "SELECT id, repository, name, head FROM branches WHERE repository = ?1 AND name = ?2",
            params![repository, name],
            |row| {
                Ok(Branch {
                    id: row.get(0)?,
                    repository: row.get(1)?,
                    name: row.get(2)?,
                    head: row.get(3)?,
                })
            },
        )
        .context("Failed to get branch")
    }

    /// Get a branch by ID
    pub fn branch(&self, id: i64) -> Result<Option<Branch>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, repository, name, head FROM branches WHERE id = ?1",
            params![id],
            |row| {
                Ok(Branch {
                    id: row.get(0)?,
                    repository: row.get(1)?,
                    name: row.get(2)?,
                    head: row.get(3)?,
                })
            },
        )
        .optional()
        .context("Failed to get branch")
    }

    /// Attach a review to a branch (one review per branch)
    pub fn create_review(&self, branch: &Branch) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO reviews (repository, branch) VALUES (?1, ?2)",
            params![branch.repository, branch.id],
        )
        .context("Failed to create review")?;
        conn.query_row(
            "SELECT id FROM reviews WHERE branch = ?1",
            params![branch.id],
            |row| row.get(0),
        )
        .context("Failed to get review")
    }

    /// Record a new head for a branch; the update starts where the previous
    /// recorded update (or the current head) left off
    pub fn record_branch_update(&self, branch: i64, to_head: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO branchupdates (branch, from_head, to_head, updated_at) \
             VALUES (?1, COALESCE( \
                 (SELECT to_head FROM branchupdates WHERE branch = ?1 ORDER BY id DESC LIMIT 1), \
                 (SELECT head FROM branches WHERE id = ?1)), ?2, ?3)",
            params![branch, to_head, chrono::Utc::now().to_rfc3339()],
        )
        .context("Failed to record branch update")?;
        Ok(conn.last_insert_rowid())
    }

    /// Unprocessed branch updates in recording order
    pub fn pending_branch_updates(&self) -> Result<Vec<BranchUpdate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bu.id, bu.branch, b.repository, r.id, bu.from_head, bu.to_head \
             FROM branchupdates bu \
             JOIN branches b ON b.id = bu.branch \
             LEFT JOIN reviews r ON r.branch = b.id \
             WHERE bu.processed = 0 ORDER BY bu.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BranchUpdate {
                id: row.get(0)?,
                branch: row.get(1)?,
                repository: row.get(2)?,
                review: row.get(3)?,
                from_head: row.get(4)?,
                to_head: row.get(5)?,
            })
        })?;

        let mut updates = Vec::new();
        for row in rows {
            updates.push(row?);
        }
        Ok(updates)
    }

    /// Attach the requested changesets to the review, queue a review event,
    /// advance the branch head and mark the update processed
    pub fn finish_branch_update(
        &self,
        update: &BranchUpdate,
        changesets: &[(i64, bool)],
    ) -> Result<Option<i64>> {
        self.transaction(|tx| {
            let mut event = None;

            if let Some(review) = update.review {
                let mut insert = tx.prepare_cached(
                    "INSERT OR IGNORE INTO reviewchangesets (review, branchupdate, changeset, squashed) \
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (changeset, squashed) in changesets {
                    insert.execute(params![review, update.id, changeset, squashed])?;
                }

                tx.execute(
                    "INSERT OR IGNORE INTO reviewevents (review, branchupdate, created_at) \
                     VALUES (?1, ?2, ?3)",
                    params![review, update.id, chrono::Utc::now().to_rfc3339()],
                )?;
                event = Some(tx.query_row(
                    "SELECT id FROM reviewevents WHERE branchupdate = ?1",
                    params![update.id],
                    |row| row.get(0),
                )?);
            }

            tx.execute(
                "UPDATE branches SET head = ?2 WHERE id = ?1",
                params![update.branch, update.to_head],
            )?;
            tx.execute(
                "UPDATE branchupdates SET processed = 1 WHERE id = ?1",
                params![update.id],
            )?;
            Ok(event)
        })
        .with_context(|| format!("Failed to finish branch update {}", update.id))
    }

    // ==================== Review Events ====================

    /// Review events not yet processed
    pub fn pending_review_events(&self) -> Result<Vec<ReviewEvent>> {
        self.query_review_events(
            "SELECT id, review, branchupdate, processed, summary FROM reviewevents \
             WHERE processed = 0 ORDER BY id",
            [],
        )
    }

    /// Get a review event by ID
    pub fn review_event(&self, id: i64) -> Result<Option<ReviewEvent>> {
        Ok(self
            .query_review_events(
                "SELECT id, review, branchupdate, processed, summary FROM reviewevents WHERE id = ?1",
                params![id],
            )?
            .into_iter()
            .next())
    }

    fn query_review_events<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ReviewEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(ReviewEvent {
                id: row.get(0)?,
                review: row.get(1)?,
                branchupdate: row.get(2)?,
                processed: row.get(3)?,
                summary: row.get(4)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Changesets of the branch update an event reports, with squashed flag
    pub fn review_event_changesets(&self, event: &ReviewEvent) -> Result<Vec<(i64, bool)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT changeset, squashed FROM reviewchangesets \
             WHERE review = ?1 AND branchupdate = ?2 ORDER BY changeset",
        )?;
        let rows = stmt.query_map(params![event.review, event.branchupdate], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;

        let mut changesets = Vec::new();
        for row in rows {
            changesets.push(row?);
        }
        Ok(changesets)
    }

    /// Store the summary and mark the event processed
    pub fn complete_review_event(&self, id: i64, summary: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE reviewevents SET processed = 1, summary = ?2 WHERE id = ?1 AND processed = 0",
            params![id, summary],
        )
        .context("Failed to complete review event")?;
        Ok(())
    }

    /// (changed files, deleted lines, inserted lines) of a changeset
    pub fn changeset_line_totals(&self, changeset: i64) -> Result<(i64, i64, i64)> {
        let conn = self.conn()?;
        let files: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM changedfiles WHERE changeset = ?1",
                params![changeset],
                |row| row.get(0),
            )
            .context("Failed to count changed files")?;
        let (deleted, inserted): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(delete_length), 0), COALESCE(SUM(insert_length), 0) \
                 FROM changesetchangedlines WHERE changeset = ?1",
                params![changeset],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to sum changed lines")?;
        Ok((files, deleted, inserted))
    }
}
