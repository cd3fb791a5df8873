use crate::storage::Database;
use anyhow::Result;
use std::collections::HashMap;

/// Path to file id mapping owned by the runner loop
///
/// Ids are never reused, so entries stay valid for the life of the process.
#[derive(Debug, Default)]
pub struct FileIdCache {
    ids: HashMap<String, i64>,
}

impl FileIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure every path has an id, inserting rows for new paths
    pub fn ensure(&mut self, db: &Database, paths: &[String]) -> Result<()> {
        let missing: Vec<String> = paths
            .iter()
            .filter(|path| !self.ids.contains_key(path.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.ids.extend(db.ensure_paths(&missing)?);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<i64> {
        self.ids.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
