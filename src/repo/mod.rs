//! Content store access
//!
//! This module wraps git object access for the engine:
//! - Resolving revisions and walking commit ranges
//! - Tree-to-tree change detection between two commits
//! - Reading blobs with binary classification
//!
//! A [`Repository`] is opened per job and dropped when the job's blocking
//! section ends; handles are never shared across tasks.

mod change;

pub use change::{ChangeKind, ChangedFile};

use anyhow::{Context, Result};
use git2::{DiffOptions, FileMode, Oid, Repository as GitRepo, Sort};
use std::path::{Path, PathBuf};

/// A git repository registered with the engine
pub struct Repository {
    /// The underlying git2 repository
    repo: GitRepo,
    /// Path the repository was opened from
    path: PathBuf,
}

/// Blob contents with git's binary classification
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub is_binary: bool,
}

/// A commit reached by a revision walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha1: String,
    pub parents: Vec<String>,
}

impl Repository {
    /// Open an existing (possibly bare) repository at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let repo = GitRepo::open(path)
            .with_context(|| format!("Failed to open Git repository at {:?}", path))?;

        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    /// Get the path this repository was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a revision expression to a full commit SHA-1
    pub fn resolve_commit(&self, rev: &str) -> Result<String> {
        let commit = self
            .repo
            .revparse_single(rev)
            .with_context(|| format!("Failed to parse revision: {}", rev))?
            .peel_to_commit()
            .context("Failed to peel to commit")?;
        Ok(commit.id().to_string())
    }

    /// Parents of a commit, first parent first
    pub fn commit_parents(&self, sha1: &str) -> Result<Vec<String>> {
        let commit = self.find_commit(sha1)?;
        Ok(commit.parent_ids().map(|id| id.to_string()).collect())
    }

    /// Best common ancestor of two commits
    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let base = self
            .repo
            .merge_base(parse_oid(a)?, parse_oid(b)?)
            .with_context(|| format!("Failed to find merge base of {} and {}", a, b))?;
        Ok(base.to_string())
    }

    /// Commits reachable from `to` but not from `from`, oldest first
    pub fn commits_between(&self, from: Option<&str>, to: &str) -> Result<Vec<CommitInfo>> {
        let mut walk = self.repo.revwalk().context("Failed to create revision walker")?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)
            .context("Failed to configure revision walker")?;
        walk.push(parse_oid(to)?)
            .with_context(|| format!("Failed to walk from {}", to))?;
        if let Some(from) = from {
            walk.hide(parse_oid(from)?)
                .with_context(|| format!("Failed to hide {}", from))?;
        }

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid.context("Failed to walk commits")?;
            let commit = self.repo.find_commit(oid).context("Failed to read commit")?;
            commits.push(CommitInfo {
                sha1: oid.to_string(),
                parents: commit.parent_ids().map(|id| id.to_string()).collect(),
            });
        }

        Ok(commits)
    }

    /// Get changes between two commits; `from` is `None` for a root commit
    ///
    /// Renames are not detected: a moved file shows up as one removal and one
    /// addition. Submodule entries are skipped.
    pub fn changes_between(&self, from: Option<&str>, to: &str) -> Result<Vec<ChangedFile>> {
        let to_tree = self
            .find_commit(to)?
            .tree()
            .context("Failed to get tree for 'to' commit")?;

        let from_tree = match from {
            Some(from) => Some(
                self.find_commit(from)?
                    .tree()
                    .context("Failed to get tree for 'from' commit")?,
            ),
            None => None,
        };

        let mut diff_opts = DiffOptions::new();
        diff_opts.include_typechange(true);

        let diff = self
            .repo
            .diff_tree_to_tree(from_tree.as_ref(), Some(&to_tree), Some(&mut diff_opts))
            .context("Failed to compute diff")?;

        let mut changes = Vec::new();

        for delta in diff.deltas() {
            let old = delta.old_file();
            let new = delta.new_file();

            if old.mode() == FileMode::Commit || new.mode() == FileMode::Commit {
                continue;
            }

            let path = new
                .path()
                .or_else(|| old.path())
                .map(|p| p.to_string_lossy().into_owned());

            let Some(path) = path else {
                continue;
            };

            let side = |id: Oid, mode: FileMode| {
                if id.is_zero() {
                    (None, None)
                } else {
                    (Some(id.to_string()), Some(u32::from(mode)))
                }
            };

            let (old_sha1, old_mode) = side(old.id(), old.mode());
            let (new_sha1, new_mode) = side(new.id(), new.mode());

            changes.push(ChangedFile {
                path,
                old_sha1,
                old_mode,
                new_sha1,
                new_mode,
            });
        }

        Ok(changes)
    }

    /// Read a blob by SHA-1
    pub fn read_blob(&self, sha1: &str) -> Result<Blob> {
        let blob = self
            .repo
            .find_blob(parse_oid(sha1)?)
            .with_context(|| format!("Failed to read blob {}", sha1))?;

        Ok(Blob {
            is_binary: blob.is_binary(),
            data: blob.content().to_vec(),
        })
    }

    fn find_commit(&self, sha1: &str) -> Result<git2::Commit<'_>> {
        self.repo
            .revparse_single(sha1)
            .with_context(|| format!("Failed to parse revision: {}", sha1))?
            .peel_to_commit()
            .context("Failed to peel to commit")
    }
}

fn parse_oid(sha1: &str) -> Result<Oid> {
    Oid::from_str(sha1).with_context(|| format!("Invalid object id: {}", sha1))
}
