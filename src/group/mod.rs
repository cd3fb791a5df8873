//! Job groups
//!
//! A group owns the jobs working towards one consumer goal: the content
//! difference of a changeset (with its merge reference) or one custom
//! highlight request. The runner asks a group for its next job, reports
//! outcomes back, and when the group has nothing queued or running asks it to
//! recalculate what its persisted state still requires.

mod changeset;
mod highlight;

pub use changeset::ChangesetGroup;
pub use highlight::HighlightGroup;

use crate::error::JobFailure;
use crate::jobs::Job;
use crate::runner::Notification;
use crate::storage::Database;
use anyhow::Result;
use std::collections::HashSet;
use std::time::Instant;

/// Identifies a group in the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    Changeset(i64),
    Highlight(i64),
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupId::Changeset(id) => write!(f, "changeset {}", id),
            GroupId::Highlight(id) => write!(f, "highlight file {}", id),
        }
    }
}

/// Job bookkeeping of one group
///
/// A key lives in at most one of queued, running, processed and failed.
/// Keys that reached processed or failed are never queued again.
#[derive(Debug, Default)]
pub struct GroupJobs {
    queued: Vec<Job>,
    queued_keys: HashSet<String>,
    running: HashSet<String>,
    processed: HashSet<String>,
    failed: HashSet<String>,
}

impl GroupJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failures recorded by earlier runs
    pub fn load_failed(&mut self, keys: HashSet<String>) {
        self.failed.extend(keys);
    }

    /// Queue jobs not seen before; returns whether any was queued
    pub fn add_jobs(&mut self, jobs: Vec<Job>) -> bool {
        let mut added = false;
        for job in jobs {
            let key = job.key().to_string();
            if self.queued_keys.contains(&key)
                || self.running.contains(&key)
                || self.processed.contains(&key)
                || self.failed.contains(&key)
            {
                continue;
            }
            self.queued_keys.insert(key);
            self.queued.push(job);
            added = true;
        }
        if added {
            // Stable, so jobs of equal priority keep their discovery order
            self.queued.sort_by_key(Job::priority);
        }
        added
    }

    /// Take the most urgent queued job and mark it running
    pub fn start_next(&mut self) -> Option<Job> {
        if self.queued.is_empty() {
            return None;
        }
        let job = self.queued.remove(0);
        let key = job.key().to_string();
        self.queued_keys.remove(&key);
        self.running.insert(key);
        Some(job)
    }

    /// The job's output is persisted
    pub fn finish(&mut self, key: &str) {
        self.running.remove(key);
        self.processed.insert(key.to_string());
    }

    /// The job failed for good
    pub fn fail(&mut self, key: &str) {
        self.running.remove(key);
        self.failed.insert(key.to_string());
    }

    /// The job failed and was replaced by finer jobs
    pub fn replace(&mut self, key: &str, parts: Vec<Job>) {
        self.running.remove(key);
        self.processed.insert(key.to_string());
        self.add_jobs(parts);
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Nothing queued and nothing running
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn is_queued(&self, key: &str) -> bool {
        self.queued_keys.contains(key)
    }

    pub fn is_failed(&self, key: &str) -> bool {
        self.failed.contains(key)
    }
}

/// A unit of consumer-facing work scheduled by the runner
pub trait JobGroup: Send {
    fn id(&self) -> GroupId;

    /// Creation time; older groups get jobs first
    fn created(&self) -> Instant;

    fn jobs(&self) -> &GroupJobs;

    fn jobs_mut(&mut self) -> &mut GroupJobs;

    /// Queue whatever the persisted state still requires and mark finished
    /// stages complete
    fn calculate_remaining(
        &mut self,
        db: &Database,
        notifications: &mut Vec<Notification>,
    ) -> Result<()>;

    /// Called after jobs of this group were persisted
    fn jobs_finished(&mut self, _db: &Database, _finished: &[Job]) -> Result<()> {
        Ok(())
    }

    /// Record a job that failed for good
    fn record_failure(&mut self, db: &Database, job: &Job, failure: &JobFailure) -> Result<()>;

    /// Called once when the group is idle and nothing remains to queue
    fn group_finished(
        &mut self,
        db: &Database,
        notifications: &mut Vec<Notification>,
    ) -> Result<()>;

    /// Whether work was left undone because of transport failures and
    /// should be retried by a later scan
    fn deferred(&self) -> bool;
}
