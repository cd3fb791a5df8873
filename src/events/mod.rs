//! Review events
//!
//! A branch update of a review queues one event. The event is held back
//! until the content difference of every changeset it reports is complete,
//! then summarised, stored and announced on the review's channel.

use crate::runner::Notification;
use crate::storage::{Database, ReviewEvent};
use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

/// Line totals of one changeset reported by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangesetSummary {
    pub changeset: i64,
    pub squashed: bool,
    pub files: i64,
    pub deleted: i64,
    pub inserted: i64,
    pub errors: usize,
}

/// What a review learns about one branch update
///
/// Totals cover the per-commit changesets only; the squashed changeset
/// reports the same lines again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub event: i64,
    pub review: i64,
    pub changesets: Vec<ChangesetSummary>,
    pub files: i64,
    pub deleted: i64,
    pub inserted: i64,
    /// Keys of jobs that failed for good; their part of the difference is
    /// missing
    pub gaps: Vec<String>,
}

/// Completes review events whose changesets are ready
pub struct ReviewEventProcessor<'a> {
    db: &'a Database,
}

impl<'a> ReviewEventProcessor<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn process_ready(&self) -> Result<Vec<Notification>> {
        let mut notifications = Vec::new();
        for event in self.db.pending_review_events()? {
            if let Some(notification) = self.process_event(&event)? {
                notifications.push(notification);
            }
        }
        Ok(notifications)
    }

    /// Complete one event if it is ready
    pub fn process_event(&self, event: &ReviewEvent) -> Result<Option<Notification>> {
        let changesets = self.db.review_event_changesets(event)?;
        for (changeset, _) in &changesets {
            if self.db.content_difference(*changeset)? == Some(false) {
                debug!(event = event.id, changeset, "Review event waiting for changeset");
                return Ok(None);
            }
        }

        let summary = self.summarize(event, &changesets)?;
        let json =
            serde_json::to_string(&summary).context("Failed to serialize review event summary")?;
        self.db.complete_review_event(event.id, &json)?;
        info!(
            event = event.id,
            review = event.review,
            files = summary.files,
            gaps = summary.gaps.len(),
            "Review event processed"
        );
        Ok(Some(Notification::review(event.review, event.id)))
    }

    fn summarize(&self, event: &ReviewEvent, changesets: &[(i64, bool)]) -> Result<EventSummary> {
        let mut summary = EventSummary {
            event: event.id,
            review: event.review,
            changesets: Vec::with_capacity(changesets.len()),
            files: 0,
            deleted: 0,
            inserted: 0,
            gaps: Vec::new(),
        };

        for &(changeset, squashed) in changesets {
            let (files, deleted, inserted) = self.db.changeset_line_totals(changeset)?;
            let errors = self.db.changeset_errors(changeset)?;
            if !squashed {
                summary.files += files;
                summary.deleted += deleted;
                summary.inserted += inserted;
            }
            summary.gaps.extend(errors.iter().map(|e| e.job_key.clone()));
            summary.changesets.push(ChangesetSummary {
                changeset,
                squashed,
                files,
                deleted,
                inserted,
                errors: errors.len(),
            });
        }
        summary.gaps.sort();
        summary.gaps.dedup();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChangesetRequest;
    use std::path::Path;

    #[test]
    fn test_event_waits_for_content() {
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("r", Path::new("/r")).unwrap().id;
        let branch = db.ensure_branch(repo, "topic").unwrap();
        let review = db.create_review(&branch).unwrap();
        db.record_branch_update(branch.id, &"c".repeat(40)).unwrap();

        let changeset = db
            .request_changeset(&ChangesetRequest {
                repository: repo,
                to_commit: "c".repeat(40),
                content: true,
                ..Default::default()
            })
            .unwrap();
        let update = db.pending_branch_updates().unwrap().remove(0);
        let event = db
            .finish_branch_update(&update, &[(changeset, false)])
            .unwrap()
            .unwrap();

        let processor = ReviewEventProcessor::new(&db);
        assert!(processor.process_ready().unwrap().is_empty());

        db.record_error(changeset, "ExamineFiles:1:4", true, "missing blob")
            .unwrap();
        db.set_content_complete(changeset).unwrap();
        let notifications = processor.process_ready().unwrap();
        assert_eq!(notifications, vec![Notification::review(review, event)]);

        let stored = db.review_event(event).unwrap().unwrap();
        assert!(stored.processed);
        let summary: serde_json::Value =
            serde_json::from_str(stored.summary.as_deref().unwrap()).unwrap();
        assert_eq!(summary["review"], review);
        assert_eq!(summary["gaps"][0], "ExamineFiles:1:4");
        assert_eq!(summary["changesets"][0]["errors"], 1);

        assert!(processor.process_ready().unwrap().is_empty());
    }
}
