use super::{
    id_list, link_path_languages, AnalyzeChangedLines, CalculateFileDifference, ChangesetContext,
    DetectFileLanguages, Job, JobKey, JobSettings, SyntaxHighlightFile,
};
use crate::error::{FailureKind, JobFailure};
use crate::repo::Blob;
use crate::storage::{ChangedFileRow, ChangedLines, Database, Examination, FileDifference};
use crate::worker::diff::{ends_with_linebreak, split_lines, unmatched_counts};
use crate::worker::handlers::{blocking, open_repository};
use anyhow::Result;
use std::collections::HashSet;

/// Reads both versions of changed files and settles the cheap cases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamineFiles {
    pub context: ChangesetContext,
    pub files: Vec<ChangedFileRow>,
}

impl ExamineFiles {
    pub fn key(&self) -> JobKey {
        JobKey {
            class: "ExamineFiles",
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

    pub async fn execute(self) -> Result<Vec<Examination>, JobFailure> {
        blocking(move || {
            let repo = open_repository(&self.context.repository_path)?;
            let read = |sha1: Option<&str>| -> Result<Option<Blob>, JobFailure> {
                sha1.map(|sha1| {
                    repo.read_blob(sha1)
                        .map_err(|e| JobFailure::from_error(FailureKind::Input, &e))
                })
                .transpose()
            };

            let mut results = Vec::with_capacity(self.files.len());
            for file in &self.files {
                let old = read(file.old_sha1.as_deref())?;
                let new = read(file.new_sha1.as_deref())?;
                results.push(examine_file(file, old.as_ref(), new.as_ref()));
            }
            Ok(results)
        })
        .await
    }

    pub fn update_database(&self, db: &Database, results: &[Examination]) -> Result<()> {
        db.store_examination(self.context.changeset, results)?;
        if self.context.highlight {
            link_path_languages(db, &self.context)?;
        }
        Ok(())
    }

    pub fn follow_ups(&self, db: &Database, settings: &JobSettings) -> Result<Vec<Job>> {
        let files: HashSet<i64> = self.files.iter().map(|f| f.file).collect();
        let mut jobs = CalculateFileDifference::pending(db, &self.context, settings, Some(&files))?;
        jobs.extend(AnalyzeChangedLines::pending(db, &self.context, settings, Some(&files))?);
        if self.context.highlight {
            jobs.extend(DetectFileLanguages::pending(db, &self.context, Some(&files))?);
            jobs.extend(SyntaxHighlightFile::pending(db, &self.context, settings)?);
        }
        Ok(jobs)
    }

    /// Files of a changeset that have not been examined, in chunks
    pub fn pending(
        db: &Database,
        context: &ChangesetContext,
        settings: &JobSettings,
    ) -> Result<Vec<Job>> {
        let files = db.unexamined_files(context.changeset)?;
        Ok(files
            .chunks(settings.examine_chunk)
            .map(|chunk| {
                Job::Examine(ExamineFiles {
                    context: context.clone(),
                    files: chunk.to_vec(),
                })
            })
            .collect())
    }
}

/// Examine one changed file given its blobs
///
/// Added and removed text files become a single block, and so does a change
/// between two one-line files; those blocks need no line comparison. Any
/// other text modification is left pending for a comparison. Binary files
/// and mode-only changes get no blocks.
pub fn examine_file(file: &ChangedFileRow, old: Option<&Blob>, new: Option<&Blob>) -> Examination {
    let mut difference = FileDifference {
        file: file.file,
        old_is_binary: old.map_or(false, |b| b.is_binary),
        new_is_binary: new.map_or(false, |b| b.is_binary),
        ..Default::default()
    };

    let old_lines = old.filter(|b| !b.is_binary).map(|b| split_lines(&b.data));
    let new_lines = new.filter(|b| !b.is_binary).map(|b| split_lines(&b.data));

    difference.old_length = length(old, old_lines.as_deref());
    difference.new_length = length(new, new_lines.as_deref());
    difference.old_linebreak = old.map_or(false, |b| !b.is_binary && ends_with_linebreak(&b.data));
    difference.new_linebreak = new.map_or(false, |b| !b.is_binary && ends_with_linebreak(&b.data));

    let mut blocks = Vec::new();
    let binary = difference.old_is_binary || difference.new_is_binary;
    if !binary && file.old_sha1 != file.new_sha1 {
        match (old_lines.as_deref(), new_lines.as_deref()) {
            (None, Some(lines)) if !lines.is_empty() => {
                blocks.push(whole_file_block(0, lines.len()));
            }
            (Some(lines), None) if !lines.is_empty() => {
                blocks.push(whole_file_block(lines.len(), 0));
            }
            (Some([old_line]), Some([new_line])) => {
                if old_line != new_line {
                    let (delete_count, insert_count) = unmatched_counts(&[*old_line], &[*new_line]);
                    blocks.push(ChangedLines {
                        index: 0,
                        offset: 0,
                        delete_count: delete_count as i64,
                        delete_length: 1,
                        insert_count: insert_count as i64,
                        insert_length: 1,
                        analysis: None,
                    });
                }
            }
            (Some(_), Some(_)) => difference.comparison_pending = true,
            _ => {}
        }
    }

    Examination { difference, blocks }
}

/// Lines of a text version, bytes of a binary one
fn length(blob: Option<&Blob>, lines: Option<&[&[u8]]>) -> Option<i64> {
    match (blob, lines) {
        (_, Some(lines)) => Some(lines.len() as i64),
        (Some(blob), None) => Some(blob.data.len() as i64),
        (None, None) => None,
    }
}

fn whole_file_block(deleted: usize, inserted: usize) -> ChangedLines {
    ChangedLines {
        index: 0,
        offset: 0,
        delete_count: deleted as i64,
        delete_length: deleted as i64,
        insert_count: inserted as i64,
        insert_length: inserted as i64,
        analysis: Some(String::new()),
    }
}
