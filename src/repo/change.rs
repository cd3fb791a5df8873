//! Tree-level change records

use serde::{Deserialize, Serialize};

/// One file altered between two trees
///
/// A side is `None` when the file does not exist on it: `old_sha1` is absent
/// for added files and `new_sha1` for removed ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Path relative to the repository root
    pub path: String,
    pub old_sha1: Option<String>,
    pub old_mode: Option<u32>,
    pub new_sha1: Option<String>,
    pub new_mode: Option<u32>,
}

impl ChangedFile {
    pub fn kind(&self) -> ChangeKind {
        match (&self.old_sha1, &self.new_sha1) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Deleted,
            (Some(old), Some(new)) if old == new => ChangeKind::ModeChanged,
            _ => ChangeKind::Modified,
        }
    }

    pub fn is_added(&self) -> bool {
        self.kind() == ChangeKind::Added
    }

    pub fn is_removed(&self) -> bool {
        self.kind() == ChangeKind::Deleted
    }
}

/// Type of change made to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// File was added
    Added,
    /// Contents changed
    Modified,
    /// Only the mode changed
    ModeChanged,
    /// File was deleted
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::ModeChanged => write!(f, "mode changed"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(old: Option<&str>, new: Option<&str>) -> ChangedFile {
        ChangedFile {
            path: "f".to_string(),
            old_sha1: old.map(str::to_string),
            old_mode: old.map(|_| 0o100644),
            new_sha1: new.map(str::to_string),
            new_mode: new.map(|_| 0o100755),
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(file(None, Some("a")).kind(), ChangeKind::Added);
        assert_eq!(file(Some("a"), None).kind(), ChangeKind::Deleted);
        assert_eq!(file(Some("a"), Some("a")).kind(), ChangeKind::ModeChanged);
        assert_eq!(file(Some("a"), Some("b")).kind(), ChangeKind::Modified);
        assert!(file(None, Some("a")).is_added());
        assert!(file(Some("a"), None).is_removed());
    }
}
