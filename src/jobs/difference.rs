use super::{
    file_filter, id_list, request, AnalyzeChangedLines, ChangesetContext, Job, JobKey, JobSettings,
};
use crate::error::JobFailure;
use crate::runner::Transport;
use crate::storage::{ChangedFileRow, ComparedFile, Database};
use crate::worker::{FileDifferenceRequest, FileVersions, CALCULATE_FILE_DIFFERENCE};
use anyhow::Result;
use std::collections::HashSet;

/// Line-level comparison of modified text files, computed by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculateFileDifference {
    pub context: ChangesetContext,
    pub files: Vec<ChangedFileRow>,
}

impl CalculateFileDifference {
    pub fn key(&self) -> JobKey {
        JobKey {
            class: "CalculateFileDifference",
            group: self.context.changeset.to_string(),
            item: id_list(self.files.iter().map(|f| &f.file)),
        }
    }

    pub fn split(&self) -> Vec<Self> {
        if self.files.len() < 2 {
            return Vec::new();
        }
        self.files
            .iter()
            .map(|file| Self {
                context: self.context.clone(),
                files: vec![file.clone()],
            })
            .collect()
    }

    pub async fn execute(self, transport: &dyn Transport) -> Result<Vec<ComparedFile>, JobFailure> {
        let payload = FileDifferenceRequest {
            repository_path: self.context.repository_path.clone(),
            files: self
                .files
                .iter()
                .map(|file| FileVersions {
                    file: file.file,
                    old_sha1: file.old_sha1.clone(),
                    new_sha1: file.new_sha1.clone(),
                })
                .collect(),
        };
        request(transport, CALCULATE_FILE_DIFFERENCE, &payload).await
    }

    pub fn update_database(&self, db: &Database, results: &[ComparedFile]) -> Result<()> {
        db.store_file_differences(self.context.changeset, results)
    }

    pub fn follow_ups(&self, db: &Database, settings: &JobSettings) -> Result<Vec<Job>> {
        let files: HashSet<i64> = self.files.iter().map(|f| f.file).collect();
        AnalyzeChangedLines::pending(db, &self.context, settings, Some(&files))
    }

    /// Files still waiting for a comparison, in chunks
    pub fn pending(
        db: &Database,
        context: &ChangesetContext,
        settings: &JobSettings,
        only: Option<&HashSet<i64>>,
    ) -> Result<Vec<Job>> {
        let files: Vec<ChangedFileRow> = db
            .pending_comparisons(context.changeset)?
            .into_iter()
            .filter(|f| file_filter(only, f.file))
            .collect();
        Ok(files
            .chunks(settings.file_difference_chunk)
            .map(|chunk| {
                Job::FileDifference(CalculateFileDifference {
                    context: context.clone(),
                    files: chunk.to_vec(),
                })
            })
            .collect())
    }
}
