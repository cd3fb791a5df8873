use super::{ChangesetContext, ExamineFiles, Job, JobKey, JobSettings};
use crate::error::{FailureKind, JobFailure};
use crate::repo::ChangedFile;
use crate::runner::FileIdCache;
use crate::storage::{Changeset, Database};
use crate::worker::handlers::{blocking, open_repository};
use anyhow::{Context, Result};

/// Lists the files changed between the two commits of a changeset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculateStructureDifference {
    pub context: ChangesetContext,
    pub from_commit: Option<String>,
    pub to_commit: String,
    /// One side of a merge pair; the changeset completes when the pair is
    /// pruned rather than here
    pub merge: bool,
}

impl CalculateStructureDifference {
    pub fn for_changeset(context: ChangesetContext, changeset: &Changeset) -> Self {
        Self {
            context,
            from_commit: changeset.from_commit.clone(),
            to_commit: changeset.to_commit.clone(),
            merge: changeset.for_merge.is_some(),
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            class: "CalculateStructureDifference",
            group: self.context.changeset.to_string(),
            item: String::new(),
        }
    }

    pub async fn execute(self) -> Result<Vec<ChangedFile>, JobFailure> {
        blocking(move || {
            let repo = open_repository(&self.context.repository_path)?;
            repo.changes_between(self.from_commit.as_deref(), &self.to_commit)
                .map_err(|e| JobFailure::from_error(FailureKind::Input, &e))
        })
        .await
    }

    pub fn update_database(
        &self,
        db: &Database,
        changes: &[ChangedFile],
        files: &FileIdCache,
    ) -> Result<()> {
        let mut rows = Vec::with_capacity(changes.len());
        for change in changes {
            let file = files
                .get(&change.path)
                .with_context(|| format!("No file id for {}", change.path))?;
            rows.push((file, change.clone()));
        }
        db.store_structure(self.context.changeset, &rows, !self.merge)
    }

    pub fn follow_ups(&self, db: &Database, settings: &JobSettings) -> Result<Vec<Job>> {
        if self.merge || !self.context.content {
            return Ok(Vec::new());
        }
        ExamineFiles::pending(db, &self.context, settings)
    }
}
