//! Job runner
//!
//! One task owns every group and all scheduling state. Each pass it:
//! - Starts ready jobs, oldest group first, while the pool has free slots
//! - Persists finished jobs (file ids first, then the database update) and
//!   queues their follow-ups
//! - Splits failed jobs or records them with their group
//! - Recalculates idle groups and drops the ones with nothing left
//! - Waits for a finished job, a command or the periodic scan
//!
//! Local jobs keep their pool slot while they run. Jobs sent to remote
//! workers give it back once dispatched, so the broker's subscriber capacity
//! bounds them instead.

mod dispatch;
mod files;
mod notify;

pub use dispatch::{LocalTransport, PubsubTransport, Transport};
pub use files::FileIdCache;
pub use notify::{LogPublisher, Notification, Publisher, PubsubPublisher, RecordingPublisher};

use crate::config::EngineConfig;
use crate::error::JobFailure;
use crate::events::ReviewEventProcessor;
use crate::group::{ChangesetGroup, GroupId, HighlightGroup, JobGroup};
use crate::jobs::{Job, JobOutput, JobSettings};
use crate::review::ReviewUpdater;
use crate::storage::Database;
use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

enum Command {
    Scan,
    Terminate,
}

/// Controls a running [`JobRunner`] from other tasks
#[derive(Clone)]
pub struct RunnerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RunnerHandle {
    /// Look for new work now instead of at the next periodic scan
    pub fn scan(&self) {
        let _ = self.commands.send(Command::Scan);
    }

    /// Stop starting jobs; the runner returns once running jobs are stored
    pub fn terminate(&self) {
        let _ = self.commands.send(Command::Terminate);
    }
}

struct Completion {
    group: GroupId,
    job: Job,
    result: Result<JobOutput, JobFailure>,
    started: Instant,
}

/// What a runner did before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub started: usize,
    pub finished: usize,
    pub split: usize,
    pub failed: usize,
    pub groups: usize,
}

/// Schedules the jobs of every group
pub struct JobRunner {
    db: Arc<Database>,
    settings: JobSettings,
    scan_interval: Duration,
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publisher>,
    files: FileIdCache,
    /// In creation order
    groups: Vec<Box<dyn JobGroup>>,
    /// Running shared job keys and the other groups waiting for them
    shared: HashMap<String, Vec<GroupId>>,
    /// Finished shared jobs still queued by some live group
    completed_shared: HashSet<String>,
    /// Finished groups are not created again until the next periodic scan
    resting: HashSet<GroupId>,
    slots: Arc<Semaphore>,
    in_flight: usize,
    completion_sender: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    command_sender: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    terminating: bool,
    stats: RunnerStats,
}

impl JobRunner {
    pub fn new(
        db: Arc<Database>,
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let (completion_sender, completions) = mpsc::unbounded_channel();
        let (command_sender, commands) = mpsc::unbounded_channel();
        Self {
            db,
            settings: JobSettings::from(config),
            scan_interval: config.runner.scan_interval(),
            transport,
            publisher,
            files: FileIdCache::new(),
            groups: Vec::new(),
            shared: HashMap::new(),
            completed_shared: HashSet::new(),
            resting: HashSet::new(),
            slots: Arc::new(Semaphore::new(config.runner.effective_workers())),
            in_flight: 0,
            completion_sender,
            completions,
            command_sender,
            commands,
            terminating: false,
            stats: RunnerStats::default(),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            commands: self.command_sender.clone(),
        }
    }

    /// Run until terminated, or with `until_idle` until no group, running
    /// job or new work remains
    pub async fn run(&mut self, until_idle: bool) -> Result<RunnerStats> {
        info!(
            workers = self.slots.available_permits(),
            remote = self.transport.is_remote(),
            "Runner starting"
        );
        self.scan()?;

        let mut timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.scan_interval,
            self.scan_interval,
        );

        loop {
            self.start_jobs();
            self.recalculate();
            self.start_jobs();

            if self.in_flight == 0 {
                if self.terminating {
                    break;
                }
                if until_idle && self.groups.is_empty() {
                    if self.scan()? == 0 {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                Some(completion) = self.completions.recv() => {
                    self.complete(completion);
                    while let Ok(completion) = self.completions.try_recv() {
                        self.complete(completion);
                    }
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Scan => {
                        self.scan()?;
                    }
                    Command::Terminate => {
                        info!(running = self.in_flight, "Runner terminating");
                        self.terminating = true;
                    }
                },
                _ = timer.tick() => {
                    self.resting.clear();
                    self.scan()?;
                }
            }
        }

        info!(
            started = self.stats.started,
            finished = self.stats.finished,
            failed = self.stats.failed,
            "Runner stopped"
        );
        Ok(self.stats)
    }

    // ==================== Starting ====================

    fn start_jobs(&mut self) {
        while !self.terminating {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let Some((group, job)) = self.next_job() else {
                break;
            };
            if job.is_shared() && !self.share(group, &job) {
                continue;
            }
            self.spawn(group, job, permit);
        }
    }

    fn next_job(&mut self) -> Option<(GroupId, Job)> {
        self.groups.iter_mut().find_map(|group| {
            let id = group.id();
            group.jobs_mut().start_next().map(|job| (id, job))
        })
    }

    /// Attach a group to an identical shared job; returns whether the job
    /// still has to be executed
    fn share(&mut self, group: GroupId, job: &Job) -> bool {
        let key = job.key().to_string();
        if self.completed_shared.contains(&key) {
            if let Some(owner) = self.groups.iter_mut().find(|g| g.id() == group) {
                owner.jobs_mut().finish(&key);
            }
            return false;
        }
        if let Some(waiting) = self.shared.get_mut(&key) {
            debug!(group = %group, job = %key, "Waiting for shared job");
            waiting.push(group);
            return false;
        }
        self.shared.insert(key, Vec::new());
        true
    }

    fn spawn(&mut self, group: GroupId, job: Job, permit: OwnedSemaphorePermit) {
        let transport = self.transport.clone();
        let sender = self.completion_sender.clone();
        let keep_slot = job.is_local() || !transport.is_remote();
        debug!(group = %group, job = %job.key(), "Starting job");
        self.in_flight += 1;
        self.stats.started += 1;

        tokio::spawn(async move {
            let started = Instant::now();
            let permit = if keep_slot {
                Some(permit)
            } else {
                drop(permit);
                None
            };

            let execution = {
                let job = job.clone();
                tokio::spawn(async move { job.execute(transport.as_ref()).await })
            };
            let result = match execution.await {
                Ok(result) => result,
                Err(e) => Err(JobFailure::internal(format!("Job task failed: {}", e))),
            };
            drop(permit);

            let _ = sender.send(Completion {
                group,
                job,
                result,
                started,
            });
        });
    }

    // ==================== Finishing ====================

    fn complete(&mut self, completion: Completion) {
        self.in_flight -= 1;
        let Completion {
            group,
            job,
            result,
            started,
        } = completion;
        let key = job.key().to_string();

        let mut owners = vec![group];
        if job.is_shared() {
            owners.extend(self.shared.remove(&key).unwrap_or_default());
        }

        let outcome = result.and_then(|output| {
            self.persist(&job, &output).map_err(|e| {
                JobFailure::internal(format!("Failed to store job output: {:#}", e))
            })
        });

        match outcome {
            Ok(follow_ups) => {
                self.stats.finished += 1;
                debug!(
                    job = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    follow_ups = follow_ups.len(),
                    "Job finished"
                );
                if job.is_shared() {
                    self.completed_shared.insert(key.clone());
                }

                let mut follow_ups = Some(follow_ups);
                for owner in self.groups.iter_mut().filter(|g| owners.contains(&g.id())) {
                    owner.jobs_mut().finish(&key);
                    if owner.id() == group {
                        if let Some(jobs) = follow_ups.take() {
                            owner.jobs_mut().add_jobs(jobs);
                        }
                    }
                    if let Err(e) = owner.jobs_finished(&self.db, std::slice::from_ref(&job)) {
                        warn!(group = %owner.id(), error = %e, "Finish hook failed");
                    }
                }
            }
            Err(failure) => self.fail(&owners, &job, failure),
        }
    }

    /// Store a job's output and find its follow-ups
    fn persist(&mut self, job: &Job, output: &JobOutput) -> Result<Vec<Job>> {
        self.files.ensure(&self.db, &job.referenced_paths(output))?;
        job.update_database(&self.db, output, &self.files)?;
        job.follow_ups(&self.db, &self.settings)
    }

    fn fail(&mut self, owners: &[GroupId], job: &Job, failure: JobFailure) {
        let key = job.key().to_string();
        let parts = job.split();
        if parts.is_empty() {
            self.stats.failed += 1;
            warn!(job = %key, kind = ?failure.kind, error = %failure, "Job failed");
        } else {
            self.stats.split += 1;
            warn!(job = %key, parts = parts.len(), error = %failure, "Job failed, retrying in parts");
        }

        for owner in self.groups.iter_mut().filter(|g| owners.contains(&g.id())) {
            if parts.is_empty() {
                owner.jobs_mut().fail(&key);
                if let Err(e) = owner.record_failure(&self.db, job, &failure) {
                    error!(group = %owner.id(), job = %key, error = %format!("{:#}", e),
                        "Failed to record job failure");
                }
            } else {
                owner.jobs_mut().replace(&key, parts.clone());
            }
        }
    }

    // ==================== Groups ====================

    /// Ask idle groups for more work and drop those that have none
    fn recalculate(&mut self) {
        let mut notifications = Vec::new();
        let mut finished = 0;
        let mut index = 0;

        while index < self.groups.len() {
            let group = &mut self.groups[index];
            if !group.jobs().is_idle() {
                index += 1;
                continue;
            }
            let id = group.id();
            match group.calculate_remaining(&self.db, &mut notifications) {
                Ok(()) if !group.jobs().is_idle() => {
                    index += 1;
                    continue;
                }
                Ok(()) => {}
                Err(e) => {
                    error!(group = %id, error = %format!("{:#}", e), "Failed to calculate remaining jobs");
                }
            }

            let mut group = self.groups.remove(index);
            if let Err(e) = group.group_finished(&self.db, &mut notifications) {
                warn!(group = %id, error = %e, "Finish hook failed");
            }
            if group.deferred() {
                info!(group = %id, "Group deferred until the next periodic scan");
            }
            self.resting.insert(id);
            self.stats.groups += 1;
            finished += 1;
        }

        if finished > 0 {
            let groups = &self.groups;
            self.completed_shared
                .retain(|key| groups.iter().any(|g| g.jobs().is_queued(key)));
            match ReviewEventProcessor::new(&self.db).process_ready() {
                Ok(events) => notifications.extend(events),
                Err(e) => warn!(error = %e, "Failed to process review events"),
            }
        }
        self.publish(&notifications);
    }

    /// Create groups for persisted work that has none; returns how many
    fn scan(&mut self) -> Result<usize> {
        let mut notifications = ReviewUpdater::new(&self.db).process_pending()?;
        notifications.extend(ReviewEventProcessor::new(&self.db).process_ready()?);

        let mut created = 0;
        for id in self.db.pending_changesets()? {
            let group_id = GroupId::Changeset(id);
            if self.is_known(group_id) {
                continue;
            }
            match ChangesetGroup::load(&self.db, id, self.settings.clone()) {
                Ok(Some(group)) => {
                    self.add_group(Box::new(group), &mut notifications);
                    created += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(changeset = id, error = %format!("{:#}", e), "Failed to load changeset");
                    self.resting.insert(group_id);
                }
            }
        }

        for id in self.db.requested_highlight_files()? {
            let group_id = GroupId::Highlight(id);
            if self.is_known(group_id) {
                continue;
            }
            match HighlightGroup::load(&self.db, id, &self.settings) {
                Ok(Some(group)) => {
                    self.add_group(Box::new(group), &mut notifications);
                    created += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(highlight_file = id, error = %format!("{:#}", e),
                        "Failed to load highlight request");
                    self.resting.insert(group_id);
                }
            }
        }

        if created > 0 {
            debug!(created, groups = self.groups.len(), "Scan found work");
        }
        self.publish(&notifications);
        Ok(created)
    }

    fn is_known(&self, id: GroupId) -> bool {
        self.resting.contains(&id) || self.groups.iter().any(|g| g.id() == id)
    }

    fn add_group(&mut self, mut group: Box<dyn JobGroup>, notifications: &mut Vec<Notification>) {
        let id = group.id();
        if let Err(e) = group.calculate_remaining(&self.db, notifications) {
            warn!(group = %id, error = %format!("{:#}", e), "Failed to calculate initial jobs");
        }
        info!(group = %id, "Group created");
        self.groups.push(group);
    }

    fn publish(&self, notifications: &[Notification]) {
        for notification in notifications {
            self.publisher.publish(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HighlightConfig;
    use crate::repo::testing::{blob_sha1, commit, init};
    use crate::storage::ChangesetRequest;
    use crate::worker::{
        BatchWriter, Handlers, ANALYZE_CHANGED_LINES, CALCULATE_FILE_DIFFERENCE,
        SYNTAX_HIGHLIGHT_FILE,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        git: git2::Repository,
        db: Arc<Database>,
        repo: i64,
        handlers: Arc<Handlers>,
        publisher: Arc<RecordingPublisher>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let repo_path = dir.path().join("repo");
            std::fs::create_dir_all(&repo_path).unwrap();
            let git = init(&repo_path);

            let db_path = dir.path().join("critic.db");
            let db = Arc::new(Database::open(&db_path).unwrap());
            let repo = db.add_repository("r", &repo_path).unwrap().id;
            let writer = Arc::new(
                BatchWriter::spawn(&db_path, Duration::from_millis(20), Duration::from_millis(5))
                    .unwrap(),
            );
            let handlers = Arc::new(Handlers::new(db_path, writer, HighlightConfig::default()));

            Self {
                _dir: dir,
                git,
                db,
                repo,
                handlers,
                publisher: Arc::new(RecordingPublisher::default()),
            }
        }

        fn request(&self, from: &str, to: &str, highlight: bool) -> i64 {
            self.db
                .request_changeset(&ChangesetRequest {
                    repository: self.repo,
                    from_commit: Some(from.to_string()),
                    to_commit: to.to_string(),
                    for_merge: None,
                    content: true,
                    highlight,
                })
                .unwrap()
        }

        fn runner(&self, transport: Arc<dyn Transport>) -> JobRunner {
            let mut config = EngineConfig::default();
            config.runner.max_workers = 2;
            JobRunner::new(self.db.clone(), &config, transport, self.publisher.clone())
        }

        fn local(&self) -> Arc<dyn Transport> {
            Arc::new(LocalTransport::new(self.handlers.clone()))
        }
    }

    /// Fails every file difference request that includes `path`
    struct FailingTransport {
        inner: LocalTransport,
        db: Arc<Database>,
        path: &'static str,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn request(&self, channel: &str, payload: Value) -> Result<Value, JobFailure> {
            if channel == CALCULATE_FILE_DIFFERENCE {
                let failing = self
                    .db
                    .file_id(self.path)
                    .map_err(|e| JobFailure::internal(e.to_string()))?;
                let hit = payload["files"].as_array().map_or(false, |files| {
                    files.iter().any(|file| file["file"].as_i64() == failing)
                });
                if hit {
                    return Err(JobFailure::input("cannot compare"));
                }
            }
            self.inner.request(channel, payload).await
        }

        fn is_remote(&self) -> bool {
            false
        }
    }

    /// Counts highlight requests
    struct CountingTransport {
        inner: LocalTransport,
        highlights: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn request(&self, channel: &str, payload: Value) -> Result<Value, JobFailure> {
            if channel == SYNTAX_HIGHLIGHT_FILE {
                self.highlights.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.request(channel, payload).await
        }

        fn is_remote(&self) -> bool {
            false
        }
    }

    /// Fails every request on the given channels
    struct RejectingTransport {
        inner: LocalTransport,
        channels: &'static [&'static str],
        failure: JobFailure,
    }

    #[async_trait]
    impl Transport for RejectingTransport {
        async fn request(&self, channel: &str, payload: Value) -> Result<Value, JobFailure> {
            if self.channels.contains(&channel) {
                return Err(self.failure.clone());
            }
            self.inner.request(channel, payload).await
        }

        fn is_remote(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_added_file() {
        let fixture = Fixture::new();
        let a = commit(&fixture.git, &[("keep", b"k\n")], &[]);
        let b = commit(&fixture.git, &[("keep", b"k\n"), ("f", b"x\ny\nz\n")], &[&a]);
        let changeset = fixture.request(&a, &b, false);

        let stats = fixture.runner(fixture.local()).run(true).await.unwrap();
        assert_eq!(stats.failed, 0);

        let files = fixture.db.changed_files(changeset).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].old_sha1, None);
        assert_eq!(files[0].new_sha1, Some(blob_sha1(b"x\ny\nz\n")));

        let blocks = fixture.db.changed_lines(changeset, files[0].file).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].delete_count, 0);
        assert_eq!(blocks[0].insert_count, 3);
        assert_eq!(blocks[0].insert_length, 3);
        assert_eq!(blocks[0].analysis.as_deref(), Some(""));

        assert_eq!(fixture.db.content_difference(changeset).unwrap(), Some(true));
        assert!(fixture
            .publisher
            .channels()
            .contains(&format!("changesets/{}", changeset)));
    }

    #[tokio::test]
    async fn test_single_line_modification_is_analysed() {
        let fixture = Fixture::new();
        let a = commit(&fixture.git, &[("f", b"x\n")], &[]);
        let b = commit(&fixture.git, &[("f", b"X\n")], &[&a]);
        let changeset = fixture.request(&a, &b, false);

        fixture.runner(fixture.local()).run(true).await.unwrap();

        let file = fixture.db.changed_files(changeset).unwrap()[0].file;
        let blocks = fixture.db.changed_lines(changeset, file).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].delete_count, 1);
        assert_eq!(blocks[0].insert_count, 1);
        assert!(blocks[0].analysis.is_some());
        assert_eq!(fixture.db.content_difference(changeset).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_binary_replace() {
        let fixture = Fixture::new();
        let a = commit(&fixture.git, &[("f", b"\x00\x01\x02")], &[]);
        let b = commit(&fixture.git, &[("f", b"\x00\x03")], &[&a]);
        let changeset = fixture.request(&a, &b, false);

        fixture.runner(fixture.local()).run(true).await.unwrap();

        let differences = fixture.db.file_differences(changeset).unwrap();
        assert_eq!(differences.len(), 1);
        assert!(differences[0].old_is_binary && differences[0].new_is_binary);
        assert!(!differences[0].comparison_pending);
        assert!(fixture
            .db
            .changed_lines(changeset, differences[0].file)
            .unwrap()
            .is_empty());
        assert_eq!(fixture.db.content_difference(changeset).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_rerun_is_idle() {
        let fixture = Fixture::new();
        let a = commit(&fixture.git, &[("f", b"a\nb\nc\n")], &[]);
        let b = commit(&fixture.git, &[("f", b"a\nB\nc\nd\n")], &[&a]);
        fixture.request(&a, &b, true);

        let first = fixture.runner(fixture.local()).run(true).await.unwrap();
        assert!(first.started > 0);
        let rows = fixture.db.get_stats().unwrap();

        let second = fixture.runner(fixture.local()).run(true).await.unwrap();
        assert_eq!(second.started, 0);
        assert_eq!(fixture.db.get_stats().unwrap(), rows);
    }

    #[tokio::test]
    async fn test_failing_file_is_pinned_by_split() {
        let fixture = Fixture::new();
        let paths: Vec<String> = (0..10).map(|i| format!("f{}", i)).collect();
        let old: Vec<(&str, &[u8])> = paths
            .iter()
            .map(|path| (path.as_str(), b"a\nb\nc\n".as_slice()))
            .collect();
        let new: Vec<(&str, &[u8])> = paths
            .iter()
            .map(|path| (path.as_str(), b"a\nB\nc\nd\n".as_slice()))
            .collect();
        let a = commit(&fixture.git, &old, &[]);
        let b = commit(&fixture.git, &new, &[&a]);
        let changeset = fixture.request(&a, &b, false);

        let transport = Arc::new(FailingTransport {
            inner: LocalTransport::new(fixture.handlers.clone()),
            db: fixture.db.clone(),
            path: "f7",
        });
        let stats = fixture.runner(transport).run(true).await.unwrap();
        assert_eq!(stats.split, 1);
        assert_eq!(stats.failed, 1);

        let failing = fixture.db.file_id("f7").unwrap().unwrap();
        let errors = fixture.db.changeset_errors(changeset).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].job_key,
            format!("CalculateFileDifference:{}:{}", changeset, failing)
        );
        assert!(errors[0].fatal);

        let compared = fixture
            .db
            .file_differences(changeset)
            .unwrap()
            .into_iter()
            .filter(|d| !d.comparison_pending)
            .count();
        assert_eq!(compared, 9);
        assert_eq!(fixture.db.content_difference(changeset).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_analysis_and_highlight_failures_are_not_fatal() {
        let fixture = Fixture::new();
        let a = commit(&fixture.git, &[("main.rs", b"fn a() {}\n")], &[]);
        let b = commit(&fixture.git, &[("main.rs", b"fn b() {}\n")], &[&a]);
        let changeset = fixture.request(&a, &b, true);

        let transport = Arc::new(RejectingTransport {
            inner: LocalTransport::new(fixture.handlers.clone()),
            channels: &[ANALYZE_CHANGED_LINES, SYNTAX_HIGHLIGHT_FILE],
            failure: JobFailure::input("blob vanished"),
        });
        let stats = fixture.runner(transport).run(true).await.unwrap();
        assert!(stats.failed >= 2);

        let errors = fixture.db.changeset_errors(changeset).unwrap();
        assert!(errors
            .iter()
            .any(|e| e.job_key.starts_with("AnalyzeChangedLines:")));
        assert!(errors
            .iter()
            .any(|e| e.job_key.starts_with("SyntaxHighlightFile:")));
        assert!(errors.iter().all(|e| !e.fatal));

        // The lesser artefacts are final
        assert_eq!(fixture.db.content_difference(changeset).unwrap(), Some(true));
        assert!(fixture.db.pending_changesets().unwrap().is_empty());
        let rerun = fixture.runner(fixture.local()).run(true).await.unwrap();
        assert_eq!(rerun.started, 0);
    }

    #[tokio::test]
    async fn test_resume_after_interrupted_run() {
        let old: &[(&str, &[u8])] = &[("f", b"a\nb\nc\nd\n"), ("g", b"1\n2\n3\n")];
        let new: &[(&str, &[u8])] = &[("f", b"a\nB\nc\nD\ne\n"), ("g", b"1\n3\n4\n")];

        let clean = Fixture::new();
        let a = commit(&clean.git, old, &[]);
        let b = commit(&clean.git, new, &[&a]);
        let changeset = clean.request(&a, &b, false);
        clean.runner(clean.local()).run(true).await.unwrap();

        let resumed = Fixture::new();
        let a = commit(&resumed.git, old, &[]);
        let b = commit(&resumed.git, new, &[&a]);
        assert_eq!(resumed.request(&a, &b, false), changeset);

        // Examination is stored, no comparison is
        let interrupted = Arc::new(RejectingTransport {
            inner: LocalTransport::new(resumed.handlers.clone()),
            channels: &[CALCULATE_FILE_DIFFERENCE],
            failure: JobFailure::transport("broker restarted"),
        });
        resumed.runner(interrupted).run(true).await.unwrap();
        assert_eq!(resumed.db.content_difference(changeset).unwrap(), Some(false));
        assert!(resumed.db.changeset_errors(changeset).unwrap().is_empty());
        assert!(resumed
            .db
            .file_differences(changeset)
            .unwrap()
            .iter()
            .all(|d| d.comparison_pending));

        resumed.runner(resumed.local()).run(true).await.unwrap();

        assert_eq!(resumed.db.get_stats().unwrap(), clean.db.get_stats().unwrap());
        assert_eq!(resumed.db.content_difference(changeset).unwrap(), Some(true));
        for path in ["f", "g"] {
            let file = clean.db.file_id(path).unwrap().unwrap();
            assert_eq!(resumed.db.file_id(path).unwrap(), Some(file));
            assert_eq!(
                resumed.db.changed_lines(changeset, file).unwrap(),
                clean.db.changed_lines(changeset, file).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_merge_with_broken_reference_is_left_alone() {
        let fixture = Fixture::new();
        let base = commit(&fixture.git, &[("f", b"0\n")], &[]);
        let left = commit(&fixture.git, &[("f", b"1\n")], &[&base]);
        let right = commit(&fixture.git, &[("f", b"2\n")], &[&base]);
        let merge = commit(&fixture.git, &[("f", b"3\n")], &[&left, &right]);
        let request = |from: &str, to: &str| {
            fixture
                .db
                .request_changeset(&ChangesetRequest {
                    repository: fixture.repo,
                    from_commit: Some(from.to_string()),
                    to_commit: to.to_string(),
                    for_merge: Some(merge.clone()),
                    content: true,
                    highlight: false,
                })
                .unwrap()
        };
        let primary = request(&left, &merge);
        let reference = request(&"0".repeat(40), &left);

        let first = fixture.runner(fixture.local()).run(true).await.unwrap();
        assert_eq!(first.failed, 1);
        let errors = fixture.db.changeset_errors(reference).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].job_key.starts_with("CalculateStructureDifference:"));
        assert!(errors[0].fatal);
        assert!(fixture.db.pending_changesets().unwrap().is_empty());

        let second = fixture.runner(fixture.local()).run(true).await.unwrap();
        assert_eq!(second.groups, 0);
        assert_eq!(second.started, 0);
        assert!(fixture.db.changeset(primary).unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_highlight_shared_between_changesets() {
        let fixture = Fixture::new();
        let source: &[u8] = b"fn main() {\n    println!(\"hi\");\n}\n";
        let a = commit(&fixture.git, &[("keep", b"k\n")], &[]);
        let b = commit(&fixture.git, &[("keep", b"k\n"), ("main.rs", source)], &[&a]);
        let c = commit(
            &fixture.git,
            &[("keep", b"k\n"), ("main.rs", source), ("other", b"o\n")],
            &[&a],
        );
        let first = fixture.request(&a, &b, true);
        let second = fixture.request(&a, &c, true);

        let transport = Arc::new(CountingTransport {
            inner: LocalTransport::new(fixture.handlers.clone()),
            highlights: AtomicUsize::new(0),
        });
        let mut runner = fixture.runner(transport.clone());
        runner.run(true).await.unwrap();
        assert_eq!(transport.highlights.load(Ordering::SeqCst), 1);
        assert!(runner.completed_shared.is_empty());

        let main = fixture.db.file_id("main.rs").unwrap().unwrap();
        let linked = |changeset| {
            fixture
                .db
                .file_differences(changeset)
                .unwrap()
                .into_iter()
                .find(|d| d.file == main)
                .and_then(|d| d.new_highlightfile)
        };
        let highlight_file = linked(first).unwrap();
        assert_eq!(linked(second), Some(highlight_file));
        assert!(fixture
            .db
            .highlight_file(highlight_file)
            .unwrap()
            .unwrap()
            .highlighted);
        assert!(fixture.db.highlight_request(first).unwrap().unwrap().evaluated);
    }

    #[tokio::test]
    async fn test_merge_is_pruned() {
        let fixture = Fixture::new();
        let base = commit(&fixture.git, &[("f", b"0\n"), ("g", b"0\n")], &[]);
        let left = commit(&fixture.git, &[("f", b"1\n"), ("g", b"0\n")], &[&base]);
        let right = commit(&fixture.git, &[("f", b"0\n"), ("g", b"2\n")], &[&base]);
        let merge = commit(&fixture.git, &[("f", b"5\n"), ("g", b"2\n")], &[&left, &right]);
        let primary = fixture
            .db
            .request_changeset(&ChangesetRequest {
                repository: fixture.repo,
                from_commit: Some(left.clone()),
                to_commit: merge.clone(),
                for_merge: Some(merge.clone()),
                content: true,
                highlight: false,
            })
            .unwrap();

        fixture.runner(fixture.local()).run(true).await.unwrap();

        let primary = fixture.db.changeset(primary).unwrap().unwrap();
        assert!(primary.processed && primary.complete);
        let reference = fixture.db.merge_reference(&primary).unwrap().unwrap();
        assert!(reference.complete);
        // `g` only comes from the second parent; `f` was touched on both sides
        let paths = |id| -> Vec<String> {
            fixture
                .db
                .changed_files(id)
                .unwrap()
                .into_iter()
                .map(|f| f.path)
                .collect()
        };
        assert_eq!(paths(primary.id), vec!["f"]);
        assert_eq!(paths(reference.id), vec!["f"]);
        assert_eq!(fixture.db.content_difference(primary.id).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_review_event_after_changesets() {
        let fixture = Fixture::new();
        let a = commit(&fixture.git, &[("f", b"1\n")], &[]);
        let b = commit(&fixture.git, &[("f", b"2\n")], &[&a]);
        let branch = fixture.db.ensure_branch(fixture.repo, "topic").unwrap();
        let review = fixture.db.create_review(&branch).unwrap();
        fixture.db.record_branch_update(branch.id, &b).unwrap();

        fixture.runner(fixture.local()).run(true).await.unwrap();

        assert!(fixture.db.pending_branch_updates().unwrap().is_empty());
        assert!(fixture.db.pending_review_events().unwrap().is_empty());
        let channels = fixture.publisher.channels();
        assert_eq!(
            channels
                .iter()
                .filter(|c| **c == format!("reviews/{}", review))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_terminate_without_work() {
        let fixture = Fixture::new();
        let mut runner = fixture.runner(fixture.local());
        runner.handle().terminate();
        let stats = runner.run(false).await.unwrap();
        assert_eq!(stats, RunnerStats::default());
    }
}
