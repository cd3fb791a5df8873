use super::{GroupId, GroupJobs, JobGroup};
use crate::error::{FailureKind, JobFailure};
use crate::jobs::{
    AnalyzeChangedLines, CalculateFileDifference, CalculateStructureDifference, ChangesetContext,
    DetectFileLanguages, ExamineFiles, Job, JobSettings, SyntaxHighlightFile,
};
use crate::runner::Notification;
use crate::storage::{Changeset, ChangesetRequest, Database, RepositoryRecord};
use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct Member {
    changeset: Changeset,
    context: ChangesetContext,
}

impl Member {
    fn load(db: &Database, changeset: Changeset, repository: &RepositoryRecord) -> Result<Self> {
        let content = db.content_difference(changeset.id)?.is_some();
        let highlight = db
            .highlight_request(changeset.id)?
            .map_or(false, |state| state.requested);
        Ok(Self {
            context: ChangesetContext {
                changeset: changeset.id,
                repository: repository.id,
                repository_path: repository.path.clone(),
                content,
                highlight,
            },
            changeset,
        })
    }

    fn structure_job(&self) -> Job {
        Job::Structure(CalculateStructureDifference::for_changeset(
            self.context.clone(),
            &self.changeset,
        ))
    }
}

/// Works a changeset through its stages
///
/// For a merge the group also owns the reference changeset (merge base
/// against the first parent); once both structures exist they are pruned to
/// the files changed on both sides before any content work starts.
pub struct ChangesetGroup {
    primary: Member,
    reference: Option<Member>,
    jobs: GroupJobs,
    settings: JobSettings,
    created: Instant,
    transient_failures: bool,
}

impl ChangesetGroup {
    /// Load the group for a changeset; `None` when it no longer exists
    pub fn load(db: &Database, id: i64, settings: JobSettings) -> Result<Option<Self>> {
        let Some(changeset) = db.changeset(id)? else {
            return Ok(None);
        };
        let repository = db
            .repository(changeset.repository)?
            .with_context(|| format!("Repository {} not found", changeset.repository))?;
        let primary = Member::load(db, changeset, &repository)?;

        let reference = if primary.changeset.is_merge() {
            Self::reference(db, &primary, &repository)?
        } else {
            None
        };

        let mut jobs = GroupJobs::new();
        jobs.load_failed(db.failed_job_keys(id)?);
        if let Some(reference) = &reference {
            jobs.load_failed(db.failed_job_keys(reference.changeset.id)?);
        }

        Ok(Some(Self {
            primary,
            reference,
            jobs,
            settings,
            created: Instant::now(),
            transient_failures: false,
        }))
    }

    /// Find or request the reference changeset of a merge
    fn reference(
        db: &Database,
        primary: &Member,
        repository: &RepositoryRecord,
    ) -> Result<Option<Member>> {
        if let Some(reference) = db.merge_reference(&primary.changeset)? {
            return Member::load(db, reference, repository).map(Some);
        }

        let repo = primary.context.repository()?;
        let parents = repo.commit_parents(&primary.changeset.to_commit)?;
        let [first, second, ..] = parents.as_slice() else {
            return Ok(None);
        };
        let base = repo.merge_base(first, second)?;
        let id = db.request_changeset(&ChangesetRequest {
            repository: repository.id,
            from_commit: Some(base),
            to_commit: first.clone(),
            for_merge: primary.changeset.for_merge.clone(),
            content: primary.context.content,
            highlight: false,
        })?;
        info!(
            changeset = primary.changeset.id,
            reference = id,
            "Requested merge reference changeset"
        );
        let changeset = db
            .changeset(id)?
            .with_context(|| format!("Changeset {} not found", id))?;
        Member::load(db, changeset, repository).map(Some)
    }

    fn members(&self) -> Vec<Member> {
        std::iter::once(&self.primary)
            .chain(self.reference.as_ref())
            .cloned()
            .collect()
    }

    fn refresh(&mut self, db: &Database) -> Result<()> {
        if let Some(changeset) = db.changeset(self.primary.changeset.id)? {
            self.primary.changeset = changeset;
        }
        if let Some(reference) = self.reference.as_mut() {
            if let Some(changeset) = db.changeset(reference.changeset.id)? {
                reference.changeset = changeset;
            }
        }
        Ok(())
    }

    /// Content stages: examination, comparison and analysis
    fn calculate_content(
        &mut self,
        db: &Database,
        member: &Member,
        notifications: &mut Vec<Notification>,
    ) -> Result<()> {
        if db.content_difference(member.changeset.id)? != Some(false) {
            return Ok(());
        }
        let context = &member.context;
        let mut jobs = ExamineFiles::pending(db, context, &self.settings)?;
        jobs.extend(CalculateFileDifference::pending(
            db,
            context,
            &self.settings,
            None,
        )?);
        jobs.extend(AnalyzeChangedLines::pending(db, context, &self.settings, None)?);

        if !self.jobs.add_jobs(jobs) && !self.transient_failures {
            if db.set_content_complete(member.changeset.id)? {
                info!(changeset = member.changeset.id, "Content difference complete");
                notifications.push(Notification::changeset(member.changeset.id, "content"));
            }
        }
        Ok(())
    }

    /// Highlight stages: language detection and tokenising
    fn calculate_highlight(
        &mut self,
        db: &Database,
        member: &Member,
        notifications: &mut Vec<Notification>,
    ) -> Result<()> {
        let Some(state) = db.highlight_request(member.changeset.id)? else {
            return Ok(());
        };
        if !state.requested {
            return Ok(());
        }

        if !state.evaluated {
            let jobs = DetectFileLanguages::pending(db, &member.context, None)?;
            let content_done = db.content_difference(member.changeset.id)? == Some(true);
            if !self.jobs.add_jobs(jobs)
                && content_done
                && !self.transient_failures
                && db.set_highlight_evaluated(member.changeset.id)?
            {
                debug!(changeset = member.changeset.id, "Languages evaluated");
                notifications.push(Notification::changeset(member.changeset.id, "languages"));
            }
        }

        let jobs = SyntaxHighlightFile::pending(db, &member.context, &self.settings)?;
        self.jobs.add_jobs(jobs);
        Ok(())
    }

    /// Structure could not be calculated; nothing else can run
    fn abandon(&mut self, db: &Database, notifications: &mut Vec<Notification>) -> Result<()> {
        if self.transient_failures {
            return Ok(());
        }
        for member in self.members() {
            warn!(changeset = member.changeset.id, "Giving up on changeset");
            if db.set_content_complete(member.changeset.id)? {
                notifications.push(Notification::changeset(member.changeset.id, "content"));
            }
            db.set_highlight_evaluated(member.changeset.id)?;
        }
        Ok(())
    }
}

impl JobGroup for ChangesetGroup {
    fn id(&self) -> GroupId {
        GroupId::Changeset(self.primary.changeset.id)
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
        notifications: &mut Vec<Notification>,
    ) -> Result<()> {
        self.refresh(db)?;
        let members = self.members();

        let structure: Vec<Job> = members
            .iter()
            .filter(|m| !m.changeset.processed)
            .map(Member::structure_job)
            .collect();
        if !structure.is_empty() {
            if !self.jobs.add_jobs(structure) && self.jobs.is_idle() {
                self.abandon(db, notifications)?;
            }
            return Ok(());
        }

        if let Some(reference) = &self.reference {
            if !self.primary.changeset.complete || !reference.changeset.complete {
                info!(
                    changeset = self.primary.changeset.id,
                    reference = reference.changeset.id,
                    "Pruning merge changesets"
                );
                db.prune_merge(self.primary.changeset.id, reference.changeset.id)?;
                self.refresh(db)?;
            }
        }

        for member in &members {
            self.calculate_content(db, member, notifications)?;
        }
        for member in &members {
            self.calculate_highlight(db, member, notifications)?;
        }
        Ok(())
    }

    fn jobs_finished(&mut self, _db: &Database, finished: &[Job]) -> Result<()> {
        debug!(
            changeset = self.primary.changeset.id,
            finished = finished.len(),
            running = self.jobs.running(),
            "Jobs finished"
        );
        Ok(())
    }

    fn record_failure(&mut self, db: &Database, job: &Job, failure: &JobFailure) -> Result<()> {
        let job_key = job.key();
        let key = job_key.to_string();
        if failure.kind == FailureKind::Transport {
            warn!(changeset = self.primary.changeset.id, job = %key, error = %failure,
                "Job deferred until the next scan");
            self.transient_failures = true;
            return Ok(());
        }
        // Reference changeset jobs carry their own id
        let changeset = job_key.group.parse().unwrap_or(self.primary.changeset.id);
        let fatal = job.failure_is_fatal(failure);
        error!(
            changeset,
            job = %key,
            fatal,
            error = %failure,
            "Job failed permanently"
        );
        db.record_error(changeset, &key, fatal, &failure.detail)
    }

    fn group_finished(
        &mut self,
        _db: &Database,
        _notifications: &mut Vec<Notification>,
    ) -> Result<()> {
        if self.transient_failures {
            info!(changeset = self.primary.changeset.id, "Changeset deferred");
        } else {
            info!(changeset = self.primary.changeset.id, "Changeset processed");
        }
        Ok(())
    }

    fn deferred(&self) -> bool {
        self.transient_failures
    }
}
