//! Request handlers served by workers
//!
//! Each handler takes a JSON request received on its channel and returns a
//! JSON response. Git access and tokenising run on the blocking thread pool;
//! analysis strings and highlight rows are persisted through the
//! [`BatchWriter`] before the response is sent, so a requester that sees the
//! response also sees the rows.

use super::analysis::analyze_block;
use super::diff::{compare_file, split_lines};
use super::highlight::{decode, Highlighter};
use super::language::Language;
use super::writer::{BatchWriter, WriteItem};
use super::{
    ANALYZE_CHANGED_LINES, CALCULATE_FILE_DIFFERENCE, DETECT_FILE_LANGUAGES,
    SYNTAX_HIGHLIGHT_FILE,
};
use crate::config::HighlightConfig;
use crate::error::{FailureKind, JobFailure};
use crate::repo::Repository;
use crate::storage::{
    ComparedFile, Database, Side, INSERT_CODE_CONTEXT, INSERT_HIGHLIGHT_LINE, MARK_HIGHLIGHTED,
    SET_ANALYSIS,
};
use rusqlite::types::Value as SqlValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Old and new blob of one changed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersions {
    pub file: i64,
    pub old_sha1: Option<String>,
    pub new_sha1: Option<String>,
}

/// Request on `calculatefiledifference`; the response is `Vec<ComparedFile>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDifferenceRequest {
    pub repository_path: PathBuf,
    pub files: Vec<FileVersions>,
}

/// A file version whose language could not be told from its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionToDetect {
    pub file: i64,
    pub side: Side,
    pub sha1: String,
    pub path: String,
}

/// Request on `detectfilelanguages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectLanguagesRequest {
    pub repository_path: PathBuf,
    pub versions: Vec<VersionToDetect>,
}

/// Language found for one file version; `None` when nothing matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedLanguage {
    pub file: i64,
    pub side: Side,
    pub sha1: String,
    pub language: Option<String>,
}

/// One block to align, with line offsets from the start of each file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockToAnalyze {
    pub file: i64,
    pub old_sha1: String,
    pub new_sha1: String,
    pub index: i64,
    pub delete_offset: usize,
    pub delete_length: usize,
    pub insert_offset: usize,
    pub insert_length: usize,
}

/// Request on `analyzechangedlines`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub repository_path: PathBuf,
    pub changeset: i64,
    pub blocks: Vec<BlockToAnalyze>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub analysed: usize,
}

/// Request on `syntaxhighlightfile`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightRequest {
    pub repository_path: PathBuf,
    pub encodings: Vec<String>,
    pub sha1: String,
    pub repository_id: i64,
    pub language_id: i64,
    pub language_label: String,
    pub conflicts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightResponse {
    pub highlight_file: i64,
}

/// Worker-side request handlers
pub struct Handlers {
    db_path: PathBuf,
    writer: Arc<BatchWriter>,
    highlight: HighlightConfig,
}

impl Handlers {
    pub fn new(db_path: PathBuf, writer: Arc<BatchWriter>, highlight: HighlightConfig) -> Self {
        Self {
            db_path,
            writer,
            highlight,
        }
    }

    /// Handle one request received on `channel`
    pub async fn handle(&self, channel: &str, payload: Value) -> Result<Value, JobFailure> {
        debug!(channel, "Handling request");
        match channel {
            CALCULATE_FILE_DIFFERENCE => {
                respond(self.calculate_file_difference(parse(payload)?).await?)
            }
            DETECT_FILE_LANGUAGES => respond(self.detect_file_languages(parse(payload)?).await?),
            ANALYZE_CHANGED_LINES => respond(self.analyze_changed_lines(parse(payload)?).await?),
            SYNTAX_HIGHLIGHT_FILE => respond(self.syntax_highlight_file(parse(payload)?).await?),
            other => Err(JobFailure::internal(format!("No handler for channel {}", other))),
        }
    }

    /// Line-level comparison of each file
    pub async fn calculate_file_difference(
        &self,
        request: FileDifferenceRequest,
    ) -> Result<Vec<ComparedFile>, JobFailure> {
        blocking(move || {
            let repo = open_repository(&request.repository_path)?;
            let mut results = Vec::with_capacity(request.files.len());
            for versions in &request.files {
                let old = read_text(&repo, versions.old_sha1.as_deref())?;
                let new = read_text(&repo, versions.new_sha1.as_deref())?;
                results.push(compare_file(versions.file, &old, &new));
            }
            Ok(results)
        })
        .await
    }

    /// Source-based language detection
    pub async fn detect_file_languages(
        &self,
        request: DetectLanguagesRequest,
    ) -> Result<Vec<DetectedLanguage>, JobFailure> {
        blocking(move || {
            let repo = open_repository(&request.repository_path)?;
            let mut detected = Vec::with_capacity(request.versions.len());
            for version in request.versions {
                let blob = repo
                    .read_blob(&version.sha1)
                    .map_err(|e| JobFailure::from_error(FailureKind::Input, &e))?;
                let language = Language::from_path(&version.path)
                    .or_else(|| Language::from_source(&blob.data))
                    .map(|l| l.label().to_string());
                detected.push(DetectedLanguage {
                    file: version.file,
                    side: version.side,
                    sha1: version.sha1,
                    language,
                });
            }
            Ok(detected)
        })
        .await
    }

    /// Align old and new lines of each block and store the analysis strings
    pub async fn analyze_changed_lines(
        &self,
        request: AnalyzeRequest,
    ) -> Result<AnalyzeResponse, JobFailure> {
        let changeset = request.changeset;
        let analyses = blocking(move || {
            let repo = open_repository(&request.repository_path)?;
            let mut blobs: HashMap<String, Vec<u8>> = HashMap::new();
            let mut analyses = Vec::with_capacity(request.blocks.len());

            for block in &request.blocks {
                for sha1 in [&block.old_sha1, &block.new_sha1] {
                    if !blobs.contains_key(sha1) {
                        let data = read_text(&repo, Some(sha1))?;
                        blobs.insert(sha1.clone(), data);
                    }
                }
                let old_lines = text_lines(&blobs[&block.old_sha1]);
                let new_lines = text_lines(&blobs[&block.new_sha1]);
                let old = slice_lines(&old_lines, block.delete_offset, block.delete_length)?;
                let new = slice_lines(&new_lines, block.insert_offset, block.insert_length)?;

                analyses.push((block.file, block.index, analyze_block(&old, &new)));
            }
            Ok(analyses)
        })
        .await?;

        let analysed = analyses.len();
        let items = analyses
            .into_iter()
            .map(|(file, index, analysis)| {
                WriteItem::new(
                    SET_ANALYSIS,
                    vec![
                        SqlValue::Integer(changeset),
                        SqlValue::Integer(file),
                        SqlValue::Integer(index),
                        SqlValue::Text(analysis),
                    ],
                )
            })
            .collect();
        self.writer
            .write(items)
            .await
            .map_err(|e| JobFailure::internal(e.to_string()))?;

        Ok(AnalyzeResponse { analysed })
    }

    /// Tokenise a file version into highlight lines and code contexts
    pub async fn syntax_highlight_file(
        &self,
        request: HighlightRequest,
    ) -> Result<HighlightResponse, JobFailure> {
        let db_path = self.db_path.clone();
        let config = self.highlight.clone();

        let prepared = blocking(move || {
            let db = Database::open_existing(&db_path)
                .map_err(|e| JobFailure::from_error(FailureKind::Internal, &e))?;
            let file = db
                .find_or_insert_highlight_file(
                    request.repository_id,
                    &request.sha1,
                    request.language_id,
                    request.conflicts,
                )
                .map_err(|e| JobFailure::from_error(FailureKind::Internal, &e))?;
            drop(db);

            if file.highlighted {
                return Ok((file.id, Vec::new()));
            }

            let language = Language::from_label(&request.language_label).ok_or_else(|| {
                JobFailure::artifact(format!("Unsupported language: {}", request.language_label))
            })?;
            let repo = open_repository(&request.repository_path)?;
            let blob = repo
                .read_blob(&request.sha1)
                .map_err(|e| JobFailure::from_error(FailureKind::Input, &e))?;

            let mut items = Vec::new();
            if blob.data.len() <= config.max_file_bytes {
                let encodings = if request.encodings.is_empty() {
                    config.encodings
                } else {
                    request.encodings
                };
                let source = decode(&blob.data, &encodings);
                let highlighted = Highlighter::new()
                    .and_then(|mut h| h.highlight(&source, language, request.conflicts))
                    .map_err(|e| JobFailure::from_error(FailureKind::Artifact, &e))?;

                for (line, data) in highlighted.lines.into_iter().enumerate() {
                    items.push(WriteItem::new(
                        INSERT_HIGHLIGHT_LINE,
                        vec![
                            SqlValue::Integer(file.id),
                            SqlValue::Integer(line as i64),
                            SqlValue::Blob(data),
                        ],
                    ));
                }
                for context in highlighted.contexts {
                    items.push(WriteItem::new(
                        INSERT_CODE_CONTEXT,
                        vec![
                            SqlValue::Text(request.sha1.clone()),
                            SqlValue::Integer(request.language_id),
                            SqlValue::Integer(context.first_line as i64),
                            SqlValue::Integer(context.last_line as i64),
                            SqlValue::Text(context.label),
                        ],
                    ));
                }
            } else {
                debug!(sha1 = %request.sha1, size = blob.data.len(), "File too large to highlight");
            }
            items.push(WriteItem::new(MARK_HIGHLIGHTED, vec![SqlValue::Integer(file.id)]));
            Ok((file.id, items))
        })
        .await?;

        let (highlight_file, items) = prepared;
        self.writer
            .write(items)
            .await
            .map_err(|e| JobFailure::internal(e.to_string()))?;

        Ok(HighlightResponse { highlight_file })
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, JobFailure> {
    serde_json::from_value(payload)
        .map_err(|e| JobFailure::internal(format!("Malformed request: {}", e)))
}

fn respond<T: Serialize>(value: T) -> Result<Value, JobFailure> {
    serde_json::to_value(value)
        .map_err(|e| JobFailure::internal(format!("Failed to encode response: {}", e)))
}

pub(crate) async fn blocking<T, F>(f: F) -> Result<T, JobFailure>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, JobFailure> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| JobFailure::internal(format!("Blocking task failed: {}", e)))?
}

pub(crate) fn open_repository(path: &std::path::Path) -> Result<Repository, JobFailure> {
    Repository::open(path).map_err(|e| JobFailure::from_error(FailureKind::Input, &e))
}

/// Blob contents, or nothing for an absent side
fn read_text(repo: &Repository, sha1: Option<&str>) -> Result<Vec<u8>, JobFailure> {
    match sha1 {
        Some(sha1) => repo
            .read_blob(sha1)
            .map(|blob| blob.data)
            .map_err(|e| JobFailure::from_error(FailureKind::Input, &e)),
        None => Ok(Vec::new()),
    }
}

fn text_lines(data: &[u8]) -> Vec<String> {
    split_lines(data)
        .into_iter()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

fn slice_lines(lines: &[String], offset: usize, length: usize) -> Result<Vec<&str>, JobFailure> {
    lines
        .get(offset..offset + length)
        .map(|slice| slice.iter().map(String::as_str).collect())
        .ok_or_else(|| {
            JobFailure::input(format!(
                "Block {}..{} outside file of {} lines",
                offset,
                offset + length,
                lines.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::testing::{blob_sha1, commit, init};
    use crate::storage::{ChangesetRequest, Examination, FileDifference};
    use crate::worker::highlight::unpack_tokens;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        repo_path: PathBuf,
        db: Database,
        handlers: Handlers,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        init(&repo_path);
        let db_path = dir.path().join("critic.db");
        let db = Database::open(&db_path).unwrap();
        let writer = Arc::new(
            BatchWriter::spawn(&db_path, Duration::from_millis(50), Duration::from_millis(5))
                .unwrap(),
        );
        let handlers = Handlers::new(db_path, writer, HighlightConfig::default());
        Fixture {
            _dir: dir,
            repo_path,
            db,
            handlers,
        }
    }

    #[tokio::test]
    async fn test_calculate_file_difference() {
        let f = fixture();
        let git = git2::Repository::open(&f.repo_path).unwrap();
        commit(&git, &[("f", b"a\nb\nc\n"), ("g", b"a\nB\nc\n")], &[]);

        let request = FileDifferenceRequest {
            repository_path: f.repo_path.clone(),
            files: vec![
                FileVersions {
                    file: 1,
                    old_sha1: Some(blob_sha1(b"a\nb\nc\n")),
                    new_sha1: Some(blob_sha1(b"a\nB\nc\n")),
                },
                FileVersions {
                    file: 2,
                    old_sha1: None,
                    new_sha1: Some(blob_sha1(b"a\nb\nc\n")),
                },
            ],
        };
        let value = f
            .handlers
            .handle(CALCULATE_FILE_DIFFERENCE, serde_json::to_value(&request).unwrap())
            .await
            .unwrap();
        let compared: Vec<ComparedFile> = serde_json::from_value(value).unwrap();

        assert_eq!(compared.len(), 2);
        assert_eq!(compared[0].blocks.len(), 1);
        assert_eq!(compared[0].blocks[0].offset, 1);
        assert_eq!(compared[1].blocks[0].insert_length, 3);
    }

    #[tokio::test]
    async fn test_missing_blob_is_input_failure() {
        let f = fixture();
        let request = FileDifferenceRequest {
            repository_path: f.repo_path.clone(),
            files: vec![FileVersions {
                file: 1,
                old_sha1: Some("1".repeat(40)),
                new_sha1: None,
            }],
        };
        let failure = f.handlers.calculate_file_difference(request).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Input);

        let failure = f
            .handlers
            .handle("nosuchchannel", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Internal);
    }

    #[tokio::test]
    async fn test_detect_languages_from_source() {
        let f = fixture();
        let git = git2::Repository::open(&f.repo_path).unwrap();
        let script = b"#!/usr/bin/env python3\nprint('hi')\n";
        commit(&git, &[("tool", script), ("notes", b"plain\n")], &[]);

        let detected = f
            .handlers
            .detect_file_languages(DetectLanguagesRequest {
                repository_path: f.repo_path.clone(),
                versions: vec![
                    VersionToDetect {
                        file: 1,
                        side: Side::New,
                        sha1: blob_sha1(script),
                        path: "tool".to_string(),
                    },
                    VersionToDetect {
                        file: 2,
                        side: Side::Old,
                        sha1: blob_sha1(b"plain\n"),
                        path: "notes".to_string(),
                    },
                ],
            })
            .await
            .unwrap();

        assert_eq!(detected[0].language.as_deref(), Some("python"));
        assert_eq!(detected[1].language, None);
        assert_eq!(detected[1].side, Side::Old);
    }

    #[tokio::test]
    async fn test_analyze_changed_lines_writes_analysis() {
        let f = fixture();
        let git = git2::Repository::open(&f.repo_path).unwrap();
        let old = b"keep\nvalue = 1\n";
        let new = b"keep\nvalue = 2\n";
        let a = commit(&git, &[("f", old)], &[]);
        let b = commit(&git, &[("f", new)], &[&a]);

        let repo = f.db.add_repository("r", &f.repo_path).unwrap();
        let changeset = f
            .db
            .request_changeset(&ChangesetRequest {
                repository: repo.id,
                from_commit: Some(a),
                to_commit: b,
                content: true,
                ..Default::default()
            })
            .unwrap();
        let file = f.db.ensure_paths(&["f".to_string()]).unwrap()["f"];
        let changes = vec![(
            file,
            crate::repo::ChangedFile {
                path: "f".to_string(),
                old_sha1: Some(blob_sha1(old)),
                old_mode: Some(0o100644),
                new_sha1: Some(blob_sha1(new)),
                new_mode: Some(0o100644),
            },
        )];
        f.db.store_structure(changeset, &changes, true).unwrap();
        let compared = compare_file(file, old, new);
        f.db.store_examination(
            changeset,
            &[Examination {
                difference: FileDifference {
                    file,
                    ..Default::default()
                },
                blocks: compared.blocks,
            }],
        )
        .unwrap();

        let response = f
            .handlers
            .analyze_changed_lines(AnalyzeRequest {
                repository_path: f.repo_path.clone(),
                changeset,
                blocks: vec![BlockToAnalyze {
                    file,
                    old_sha1: blob_sha1(old),
                    new_sha1: blob_sha1(new),
                    index: 0,
                    delete_offset: 1,
                    delete_length: 1,
                    insert_offset: 1,
                    insert_length: 1,
                }],
            })
            .await
            .unwrap();
        assert_eq!(response.analysed, 1);

        let blocks = f.db.changed_lines(changeset, file).unwrap();
        assert_eq!(blocks[0].analysis.as_deref(), Some("0=0:r8-9=8-9"));
    }

    #[tokio::test]
    async fn test_highlight_is_content_addressed() {
        let f = fixture();
        let git = git2::Repository::open(&f.repo_path).unwrap();
        let source = b"def f():\n    return 1\n";
        commit(&git, &[("f.py", source)], &[]);
        let repo = f.db.add_repository("r", &f.repo_path).unwrap();
        let language = f.db.language_id("python").unwrap();

        let request = HighlightRequest {
            repository_path: f.repo_path.clone(),
            encodings: vec!["utf-8".to_string()],
            sha1: blob_sha1(source),
            repository_id: repo.id,
            language_id: language,
            language_label: "python".to_string(),
            conflicts: false,
        };
        let first = f.handlers.syntax_highlight_file(request.clone()).await.unwrap();
        let second = f.handlers.syntax_highlight_file(request).await.unwrap();
        assert_eq!(first, second);

        let file = f.db.highlight_file(first.highlight_file).unwrap().unwrap();
        assert!(file.highlighted);
        assert!(!file.requested);

        let lines = f.db.highlight_lines(file.id).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].0, 1);
        let total: usize = unpack_tokens(&lines[0].1)
            .unwrap()
            .iter()
            .map(|t| t.length)
            .sum();
        assert_eq!(total, "def f():".len());

        let contexts = f.db.code_contexts(&blob_sha1(source), language).unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].context, "def f()");
    }

    #[tokio::test]
    async fn test_unsupported_language_is_artifact_failure() {
        let f = fixture();
        let git = git2::Repository::open(&f.repo_path).unwrap();
        commit(&git, &[("x.cob", b"DISPLAY 'HI'.\n")], &[]);
        let repo = f.db.add_repository("r", &f.repo_path).unwrap();
        let language = f.db.language_id("cobol").unwrap();

        let failure = f
            .handlers
            .syntax_highlight_file(HighlightRequest {
                repository_path: f.repo_path.clone(),
                encodings: Vec::new(),
                sha1: blob_sha1(b"DISPLAY 'HI'.\n"),
                repository_id: repo.id,
                language_id: language,
                language_label: "cobol".to_string(),
                conflicts: false,
            })
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Artifact);
        assert!(!failure.fatal());
    }
}
