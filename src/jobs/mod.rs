//! Jobs of the difference engine
//!
//! A [`Job`] is one unit of scheduled work. Every job kind provides:
//! - A key identifying it for deduplication within its group
//! - A priority (lower runs first) and a split into finer jobs on failure
//! - Execution, either in-process (structure and examination) or as a
//!   request to a worker through a [`Transport`]
//! - A database update that persists its output idempotently
//! - Follow-up jobs discoverable from its output alone
//!
//! Each kind also knows how to enumerate the jobs the persisted state of a
//! changeset still requires; groups and follow-ups share those functions.

mod analyze;
mod difference;
mod examine;
mod highlight;
mod languages;
mod structure;

pub use analyze::{group_by_cost, AnalyzeChangedLines};
pub use difference::CalculateFileDifference;
pub use examine::{examine_file, ExamineFiles};
pub use highlight::SyntaxHighlightFile;
pub use languages::{link_path_languages, DetectFileLanguages};
pub use structure::CalculateStructureDifference;

use crate::config::EngineConfig;
use crate::error::{FailureKind, JobFailure};
use crate::repo::{ChangedFile, Repository};
use crate::runner::{FileIdCache, Transport};
use crate::storage::{ComparedFile, Database, Examination};
use crate::worker::{AnalyzeResponse, DetectedLanguage, HighlightResponse};
use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// Identifies a job for deduplication: `class:group:item`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub class: &'static str,
    /// Changeset id, empty for content-addressed jobs shared across groups
    pub group: String,
    pub item: String,
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.class, self.group, self.item)
    }
}

/// The changeset a job works for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetContext {
    pub changeset: i64,
    pub repository: i64,
    pub repository_path: PathBuf,
    /// Content difference requested
    pub content: bool,
    /// Highlighting requested
    pub highlight: bool,
}

impl ChangesetContext {
    /// Open the repository; the handle belongs to the caller alone
    pub fn repository(&self) -> Result<Repository> {
        Repository::open(&self.repository_path)
    }
}

/// Chunk sizes and limits applied when enumerating jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub examine_chunk: usize,
    pub file_difference_chunk: usize,
    pub analysis_cost_limit: usize,
    pub encodings: Vec<String>,
}

impl From<&EngineConfig> for JobSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            examine_chunk: config.runner.examine_chunk.max(1),
            file_difference_chunk: config.runner.file_difference_chunk.max(1),
            analysis_cost_limit: config.runner.analysis_cost_limit.max(1),
            encodings: config.highlight.encodings.clone(),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Result of a successful execution
#[derive(Debug, Clone)]
pub enum JobOutput {
    Structure(Vec<ChangedFile>),
    Examine(Vec<Examination>),
    FileDifference(Vec<ComparedFile>),
    Analyze(AnalyzeResponse),
    DetectLanguages(Vec<DetectedLanguage>),
    Highlight(HighlightResponse),
}

/// A job of any kind
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Structure(CalculateStructureDifference),
    Examine(ExamineFiles),
    FileDifference(CalculateFileDifference),
    Analyze(AnalyzeChangedLines),
    DetectLanguages(DetectFileLanguages),
    Highlight(SyntaxHighlightFile),
}

impl Job {
    pub fn key(&self) -> JobKey {
        match self {
            Job::Structure(job) => job.key(),
            Job::Examine(job) => job.key(),
            Job::FileDifference(job) => job.key(),
            Job::Analyze(job) => job.key(),
            Job::DetectLanguages(job) => job.key(),
            Job::Highlight(job) => job.key(),
        }
    }

    /// Lower values start first
    pub fn priority(&self) -> u8 {
        match self {
            Job::Structure(_) => 0,
            Job::Examine(_) => 1,
            Job::FileDifference(_) => 2,
            Job::Analyze(_) => 3,
            Job::DetectLanguages(_) => 4,
            Job::Highlight(_) => 5,
        }
    }

    /// Executed in the runner process rather than by a worker
    pub fn is_local(&self) -> bool {
        matches!(self, Job::Structure(_) | Job::Examine(_))
    }

    /// Content-addressed jobs run once per runner even when several groups
    /// need them
    pub fn is_shared(&self) -> bool {
        matches!(self, Job::Highlight(_))
    }

    /// Whether a permanent failure of this job is fatal for its changeset
    ///
    /// Analysis and highlighting only enrich a difference that exists
    /// without them, so their failures never are.
    pub fn failure_is_fatal(&self, failure: &JobFailure) -> bool {
        match self {
            Job::Analyze(_) | Job::Highlight(_) => false,
            _ => failure.fatal(),
        }
    }

    /// Finer jobs covering the same inputs; empty when the job cannot split
    pub fn split(&self) -> Vec<Job> {
        match self {
            Job::Structure(_) | Job::Highlight(_) => Vec::new(),
            Job::Examine(job) => job.split().into_iter().map(Job::Examine).collect(),
            Job::FileDifference(job) => job.split().into_iter().map(Job::FileDifference).collect(),
            Job::Analyze(job) => job.split().into_iter().map(Job::Analyze).collect(),
            Job::DetectLanguages(job) => {
                job.split().into_iter().map(Job::DetectLanguages).collect()
            }
        }
    }

    pub async fn execute(self, transport: &dyn Transport) -> Result<JobOutput, JobFailure> {
        match self {
            Job::Structure(job) => job.execute().await.map(JobOutput::Structure),
            Job::Examine(job) => job.execute().await.map(JobOutput::Examine),
            Job::FileDifference(job) => job
                .execute(transport)
                .await
                .map(JobOutput::FileDifference),
            Job::Analyze(job) => job.execute(transport).await.map(JobOutput::Analyze),
            Job::DetectLanguages(job) => job
                .execute(transport)
                .await
                .map(JobOutput::DetectLanguages),
            Job::Highlight(job) => job.execute(transport).await.map(JobOutput::Highlight),
        }
    }

    /// Repository paths the output refers to, which must have file ids
    /// before the database update
    pub fn referenced_paths(&self, output: &JobOutput) -> Vec<String> {
        match output {
            JobOutput::Structure(changes) => changes.iter().map(|c| c.path.clone()).collect(),
            _ => Vec::new(),
        }
    }

    /// Persist the output
    pub fn update_database(
        &self,
        db: &Database,
        output: &JobOutput,
        files: &FileIdCache,
    ) -> Result<()> {
        match (self, output) {
            (Job::Structure(job), JobOutput::Structure(changes)) => {
                job.update_database(db, changes, files)
            }
            (Job::Examine(job), JobOutput::Examine(results)) => job.update_database(db, results),
            (Job::FileDifference(job), JobOutput::FileDifference(results)) => {
                job.update_database(db, results)
            }
            // Analysis strings and highlight rows are written by the worker
            (Job::Analyze(_), JobOutput::Analyze(_)) => Ok(()),
            (Job::DetectLanguages(job), JobOutput::DetectLanguages(detected)) => {
                job.update_database(db, detected)
            }
            (Job::Highlight(_), JobOutput::Highlight(_)) => Ok(()),
            _ => bail!("Output does not belong to job {}", self.key()),
        }
    }

    /// Jobs made possible by this job's persisted output
    pub fn follow_ups(&self, db: &Database, settings: &JobSettings) -> Result<Vec<Job>> {
        match self {
            Job::Structure(job) => job.follow_ups(db, settings),
            Job::Examine(job) => job.follow_ups(db, settings),
            Job::FileDifference(job) => job.follow_ups(db, settings),
            Job::DetectLanguages(job) => job.follow_ups(db, settings),
            Job::Analyze(_) | Job::Highlight(_) => Ok(Vec::new()),
        }
    }
}

/// Item key for a set of ids
fn id_list<'a>(ids: impl IntoIterator<Item = &'a i64>) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn file_filter(only: Option<&HashSet<i64>>, file: i64) -> bool {
    only.map_or(true, |files| files.contains(&file))
}

/// Send a request to a worker and decode its response
async fn request<Req, Resp>(
    transport: &dyn Transport,
    channel: &str,
    request: &Req,
) -> Result<Resp, JobFailure>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_value(request)
        .map_err(|e| JobFailure::internal(format!("Failed to encode request: {}", e)))?;
    let response = transport.request(channel, payload).await?;
    serde_json::from_value(response).map_err(|e| {
        JobFailure::new(
            FailureKind::Internal,
            format!("Malformed {} response: {}", channel, e),
        )
    })
}
