//! Review branch updates
//!
//! When the head of a review branch moves, every new commit gets a
//! changeset (content and highlighting requested), a multi-commit update also
//! gets one squashed changeset over the whole range, and the review is told
//! about it through a queued review event. Updates of branches without a
//! review only advance the recorded head.

use crate::repo::{CommitInfo, Repository};
use crate::runner::Notification;
use crate::storage::{BranchUpdate, ChangesetRequest, Database};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Turns recorded branch updates into changeset requests
pub struct ReviewUpdater<'a> {
    db: &'a Database,
}

impl<'a> ReviewUpdater<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Process every unprocessed branch update in recording order
    ///
    /// An update that cannot be processed stays pending and is retried by the
    /// next scan; later updates of the same branch wait behind it.
    pub fn process_pending(&self) -> Result<Vec<Notification>> {
        let mut notifications = Vec::new();
        let mut blocked = Vec::new();

        for update in self.db.pending_branch_updates()? {
            if blocked.contains(&update.branch) {
                continue;
            }
            match self.process_update(&update) {
                Ok(Some(notification)) => notifications.push(notification),
                Ok(None) => {}
                Err(e) => {
                    warn!(branchupdate = update.id, error = %format!("{:#}", e),
                        "Failed to process branch update");
                    blocked.push(update.branch);
                }
            }
        }
        Ok(notifications)
    }

    /// Process one update; returns the review notification if there is one
    pub fn process_update(&self, update: &BranchUpdate) -> Result<Option<Notification>> {
        let Some(review) = update.review else {
            debug!(branch = update.branch, head = %update.to_head, "Branch head moved");
            self.db.finish_branch_update(update, &[])?;
            return Ok(None);
        };

        let repository = self
            .db
            .repository(update.repository)?
            .with_context(|| format!("Repository {} not found", update.repository))?;
        let repo = Repository::open(&repository.path)?;
        let commits = repo.commits_between(update.from_head.as_deref(), &update.to_head)?;

        let mut changesets = Vec::with_capacity(commits.len() + 1);
        for commit in &commits {
            changesets.push((self.request_commit(&repo, update.repository, commit)?, false));
        }
        if let (Some(from_head), true) = (&update.from_head, commits.len() > 1) {
            let squashed = self.db.request_changeset(&ChangesetRequest {
                repository: update.repository,
                from_commit: Some(from_head.clone()),
                to_commit: update.to_head.clone(),
                for_merge: None,
                content: true,
                highlight: true,
            })?;
            changesets.push((squashed, true));
        }

        let event = self.db.finish_branch_update(update, &changesets)?;
        info!(
            review,
            branchupdate = update.id,
            commits = commits.len(),
            changesets = changesets.len(),
            "Review updated"
        );
        Ok(event.map(|event| Notification::review(review, event)))
    }

    /// Request the changeset of one commit against its first parent
    fn request_commit(
        &self,
        repo: &Repository,
        repository: i64,
        commit: &CommitInfo,
    ) -> Result<i64> {
        let request = |from_commit: Option<&String>, to_commit: &str, for_merge: Option<&str>| {
            ChangesetRequest {
                repository,
                from_commit: from_commit.cloned(),
                to_commit: to_commit.to_string(),
                for_merge: for_merge.map(str::to_string),
                content: true,
                highlight: for_merge.map_or(true, |merge| merge == to_commit),
            }
        };

        match commit.parents.as_slice() {
            [first, second, ..] => {
                let base = repo.merge_base(first, second)?;
                self.db.request_changeset(&request(
                    Some(&base),
                    first.as_str(),
                    Some(commit.sha1.as_str()),
                ))?;
                self.db.request_changeset(&request(
                    Some(first),
                    &commit.sha1,
                    Some(commit.sha1.as_str()),
                ))
            }
            parents => self
                .db
                .request_changeset(&request(parents.first(), &commit.sha1, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::testing::{commit, init};

    fn setup() -> (tempfile::TempDir, git2::Repository, Database, i64) {
        let dir = tempfile::tempdir().unwrap();
        let git = init(dir.path());
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("r", dir.path()).unwrap().id;
        (dir, git, db, repo)
    }

    #[test]
    fn test_review_update_requests_changesets() {
        let (_dir, git, db, repo) = setup();
        let a = commit(&git, &[("f", b"1\n")], &[]);
        let b = commit(&git, &[("f", b"2\n")], &[&a]);
        let c = commit(&git, &[("f", b"3\n")], &[&b]);

        let branch = db.ensure_branch(repo, "topic").unwrap();
        db.record_branch_update(branch.id, &a).unwrap();
        let updater = ReviewUpdater::new(&db);
        assert!(updater.process_pending().unwrap().is_empty());

        let review = db.create_review(&branch).unwrap();
        db.record_branch_update(branch.id, &c).unwrap();
        let notifications = updater.process_pending().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].channel, format!("reviews/{}", review));

        let event = db.pending_review_events().unwrap().remove(0);
        let changesets = db.review_event_changesets(&event).unwrap();
        assert_eq!(changesets.len(), 3);
        assert_eq!(changesets.iter().filter(|(_, squashed)| *squashed).count(), 1);

        let squashed = changesets.iter().find(|(_, squashed)| *squashed).unwrap().0;
        let squashed = db.changeset(squashed).unwrap().unwrap();
        assert_eq!(squashed.from_commit.as_deref(), Some(a.as_str()));
        assert_eq!(squashed.to_commit, c);
        assert!(db.highlight_request(squashed.id).unwrap().unwrap().requested);
        assert_eq!(db.branch(branch.id).unwrap().unwrap().head, Some(c));
    }

    #[test]
    fn test_merge_commit_requests_reference() {
        let (_dir, git, db, repo) = setup();
        let base = commit(&git, &[("f", b"base\n")], &[]);
        let left = commit(&git, &[("f", b"left\n")], &[&base]);
        let right = commit(&git, &[("f", b"base\n"), ("g", b"right\n")], &[&base]);
        let merge = commit(&git, &[("f", b"left\n"), ("g", b"right\n")], &[&left, &right]);

        let branch = db.ensure_branch(repo, "topic").unwrap();
        db.record_branch_update(branch.id, &left).unwrap();
        ReviewUpdater::new(&db).process_pending().unwrap();
        db.create_review(&branch).unwrap();
        db.record_branch_update(branch.id, &merge).unwrap();
        ReviewUpdater::new(&db).process_pending().unwrap();

        let event = db.pending_review_events().unwrap().remove(0);
        let changesets = db.review_event_changesets(&event).unwrap();
        // right and merge, plus the squashed range
        assert_eq!(changesets.len(), 3);

        let primary = changesets
            .iter()
            .map(|(id, _)| db.changeset(*id).unwrap().unwrap())
            .find(|changeset| changeset.is_merge())
            .unwrap();
        assert_eq!(primary.from_commit.as_deref(), Some(left.as_str()));
        let reference = db.merge_reference(&primary).unwrap().unwrap();
        assert_eq!(reference.from_commit.as_deref(), Some(base.as_str()));
        assert_eq!(reference.to_commit, left);
        assert!(db.highlight_request(reference.id).unwrap().is_none());
    }

    #[test]
    fn test_failed_update_blocks_branch() {
        let db = Database::open_in_memory().unwrap();
        let repo = db
            .add_repository("gone", std::path::Path::new("/nonexistent/critic"))
            .unwrap()
            .id;
        let branch = db.ensure_branch(repo, "topic").unwrap();
        db.create_review(&branch).unwrap();
        db.record_branch_update(branch.id, &"a".repeat(40)).unwrap();
        db.record_branch_update(branch.id, &"b".repeat(40)).unwrap();

        assert!(ReviewUpdater::new(&db).process_pending().unwrap().is_empty());
        assert_eq!(db.pending_branch_updates().unwrap().len(), 2);
    }
}
