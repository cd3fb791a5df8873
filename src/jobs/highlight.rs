use super::{request, ChangesetContext, Job, JobKey, JobSettings};
use crate::error::JobFailure;
use crate::runner::Transport;
use crate::storage::{Database, HighlightFile};
use crate::worker::{HighlightRequest, HighlightResponse, SYNTAX_HIGHLIGHT_FILE};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Tokenises one content-addressed file version; the worker stores the lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxHighlightFile {
    pub repository: i64,
    pub repository_path: PathBuf,
    pub sha1: String,
    pub language: i64,
    pub language_label: String,
    pub conflicts: bool,
    pub encodings: Vec<String>,
}

impl SyntaxHighlightFile {
    pub fn for_file(
        db: &Database,
        repository_path: PathBuf,
        file: &HighlightFile,
        settings: &JobSettings,
    ) -> Result<Self> {
        let language_label = db
            .language_label(file.language)?
            .with_context(|| format!("Unknown highlight language {}", file.language))?;
        Ok(Self {
            repository: file.repository,
            repository_path,
            sha1: file.sha1.clone(),
            language: file.language,
            language_label,
            conflicts: file.conflicts,
            encodings: settings.encodings.clone(),
        })
    }

    /// Content-addressed, so the same artefact has the same key in every group
    pub fn key(&self) -> JobKey {
        JobKey {
            class: "SyntaxHighlightFile",
            group: String::new(),
            item: format!(
                "{}:{}:{}:{}",
                self.repository, self.sha1, self.language, self.conflicts as u8
            ),
        }
    }

    pub async fn execute(self, transport: &dyn Transport) -> Result<HighlightResponse, JobFailure> {
        let payload = HighlightRequest {
            repository_path: self.repository_path,
            encodings: self.encodings,
            sha1: self.sha1,
            repository_id: self.repository,
            language_id: self.language,
            language_label: self.language_label,
            conflicts: self.conflicts,
        };
        request(transport, SYNTAX_HIGHLIGHT_FILE, &payload).await
    }

    /// Highlight files referenced by a changeset that are not highlighted yet
    pub fn pending(
        db: &Database,
        context: &ChangesetContext,
        settings: &JobSettings,
    ) -> Result<Vec<Job>> {
        db.unhighlighted_files(context.changeset)?
            .iter()
            .map(|file| {
                SyntaxHighlightFile::for_file(db, context.repository_path.clone(), file, settings)
                    .map(Job::Highlight)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_key_matches_content_address() {
        let db = Database::open_in_memory().unwrap();
        let repo = db.add_repository("r", Path::new("/r")).unwrap().id;
        let python = db.language_id("python").unwrap();
        let file = db
            .find_or_insert_highlight_file(repo, &"a".repeat(40), python, true)
            .unwrap();

        let job =
            SyntaxHighlightFile::for_file(&db, PathBuf::from("/r"), &file, &JobSettings::default())
                .unwrap();
        assert_eq!(job.language_label, "python");
        assert_eq!(
            job.key().to_string(),
            format!("SyntaxHighlightFile::{}:{}:{}:1", repo, "a".repeat(40), python)
        );
    }
}
