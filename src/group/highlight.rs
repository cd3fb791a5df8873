use super::{GroupId, GroupJobs, JobGroup};
use crate::error::{FailureKind, JobFailure};
use crate::jobs::{Job, JobSettings, SyntaxHighlightFile};
use crate::runner::Notification;
use crate::storage::Database;
use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{info, warn};

/// A custom highlight request for one content-addressed file
pub struct HighlightGroup {
    highlight_file: i64,
    job: SyntaxHighlightFile,
    jobs: GroupJobs,
    created: Instant,
    transient_failures: bool,
}

impl HighlightGroup {
    /// Load the group; `None` when the request is gone or already satisfied
    pub fn load(db: &Database, id: i64, settings: &JobSettings) -> Result<Option<Self>> {
        let Some(file) = db.highlight_file(id)? else {
            return Ok(None);
        };
        if file.highlighted || !file.requested {
            return Ok(None);
        }
        let repository = db
            .repository(file.repository)?
            .with_context(|| format!("Repository {} not found", file.repository))?;
        let job = SyntaxHighlightFile::for_file(db, repository.path, &file, settings)?;

        Ok(Some(Self {
            highlight_file: id,
            job,
            jobs: GroupJobs::new(),
            created: Instant::now(),
            transient_failures: false,
        }))
    }
}

impl JobGroup for HighlightGroup {
    fn id(&self) -> GroupId {
        GroupId::Highlight(self.highlight_file)
    }

    fn created(&self) -> Instant {
        self.created
    }

    fn jobs(&self) -> &GroupJobs {
        &self.jobs
    }

    fn jobs_mut(&mut self) -> &mut GroupJobs {
        &mut self.jobs
    }

    fn calculate_remaining(
        &mut self,
        db: &Database,
        _notifications: &mut Vec<Notification>,
    ) -> Result<()> {
        let wanted = db
            .highlight_file(self.highlight_file)?
            .map_or(false, |file| file.requested && !file.highlighted);
        if wanted {
            self.jobs.add_jobs(vec![Job::Highlight(self.job.clone())]);
        }
        Ok(())
    }

    fn record_failure(&mut self, db: &Database, job: &Job, failure: &JobFailure) -> Result<()> {
        if failure.kind == FailureKind::Transport {
            warn!(highlight_file = self.highlight_file, error = %failure,
                "Highlighting deferred until the next scan");
            self.transient_failures = true;
            return Ok(());
        }
        warn!(
            highlight_file = self.highlight_file,
            job = %job.key(),
            error = %failure,
            "Highlighting failed, dropping request"
        );
        db.clear_highlight_request(self.highlight_file)
    }

    fn group_finished(
        &mut self,
        db: &Database,
        notifications: &mut Vec<Notification>,
    ) -> Result<()> {
        if self.transient_failures {
            return Ok(());
        }
        let highlighted = db
            .highlight_file(self.highlight_file)?
            .map_or(false, |file| file.highlighted);
        info!(highlight_file = self.highlight_file, highlighted, "Highlight request finished");
        notifications.push(Notification::highlight_file(self.highlight_file, highlighted));
        Ok(())
    }

    fn deferred(&self) -> bool {
        self.transient_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_load_only_open_requests() {
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("r", Path::new("/r")).unwrap().id;
        let sha1 = "d".repeat(40);
        let id = db.request_highlight(repo, &sha1, "rust", false).unwrap();

        let mut group = HighlightGroup::load(&db, id, &JobSettings::default())
            .unwrap()
            .unwrap();
        assert_eq!(group.id(), GroupId::Highlight(id));

        let mut notifications = Vec::new();
        group.calculate_remaining(&db, &mut notifications).unwrap();
        let job = group.jobs_mut().start_next().unwrap();
        assert!(matches!(job, Job::Highlight(_)));

        group
            .record_failure(&db, &job, &JobFailure::artifact("tokeniser failed"))
            .unwrap();
        assert!(!group.deferred());
        assert!(db.requested_highlight_files().unwrap().is_empty());
        assert!(HighlightGroup::load(&db, id, &JobSettings::default())
            .unwrap()
            .is_none());

        group.group_finished(&db, &mut notifications).unwrap();
        assert_eq!(notifications, vec![Notification::highlight_file(id, false)]);
    }
}
