use super::{file_filter, request, ChangesetContext, Job, JobKey, JobSettings};
use crate::error::JobFailure;
use crate::runner::Transport;
use crate::storage::Database;
use crate::worker::{AnalyzeRequest, AnalyzeResponse, BlockToAnalyze, ANALYZE_CHANGED_LINES};
use anyhow::Result;
use std::collections::HashSet;

/// Aligns the lines of modified blocks; the worker stores the analyses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeChangedLines {
    pub context: ChangesetContext,
    pub blocks: Vec<BlockToAnalyze>,
}

impl AnalyzeChangedLines {
    pub fn key(&self) -> JobKey {
        JobKey {
            class: "AnalyzeChangedLines",
            group: self.context.changeset.to_string(),
            item: self
                .blocks
                .iter()
                .map(|b| format!("{}/{}", b.file, b.index))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn split(&self) -> Vec<Self> {
        if self.blocks.len() < 2 {
            return Vec::new();
        }
        self.blocks
            .iter()
            .map(|block| Self {
                context: self.context.clone(),
                blocks: vec![block.clone()],
            })
            .collect()
    }

    pub async fn execute(self, transport: &dyn Transport) -> Result<AnalyzeResponse, JobFailure> {
        let payload = AnalyzeRequest {
            repository_path: self.context.repository_path.clone(),
            changeset: self.context.changeset,
            blocks: self.blocks,
        };
        request(transport, ANALYZE_CHANGED_LINES, &payload).await
    }

    /// Blocks without an analysis, grouped into jobs of bounded cost
    pub fn pending(
        db: &Database,
        context: &ChangesetContext,
        settings: &JobSettings,
        only: Option<&HashSet<i64>>,
    ) -> Result<Vec<Job>> {
        let mut blocks = Vec::new();
        for file in db.files_with_unanalyzed_blocks(context.changeset)? {
            if !file_filter(only, file.file) {
                continue;
            }
            let (Some(old_sha1), Some(new_sha1)) = (&file.old_sha1, &file.new_sha1) else {
                continue;
            };

            let mut old_position = 0;
            let mut new_position = 0;
            for lines in db.changed_lines(context.changeset, file.file)? {
                let delete_offset = old_position + lines.offset as usize;
                let insert_offset = new_position + lines.offset as usize;
                old_position = delete_offset + lines.delete_length as usize;
                new_position = insert_offset + lines.insert_length as usize;

                if lines.analysis.is_some()
                    || lines.delete_length == 0
                    || lines.insert_length == 0
                {
                    continue;
                }
                blocks.push(BlockToAnalyze {
                    file: file.file,
                    old_sha1: old_sha1.clone(),
                    new_sha1: new_sha1.clone(),
                    index: lines.index,
                    delete_offset,
                    delete_length: lines.delete_length as usize,
                    insert_offset,
                    insert_length: lines.insert_length as usize,
                });
            }
        }

        Ok(group_by_cost(blocks, settings.analysis_cost_limit)
            .into_iter()
            .map(|blocks| {
                Job::Analyze(AnalyzeChangedLines {
                    context: context.clone(),
                    blocks,
                })
            })
            .collect())
    }
}

/// Split blocks, in order, into groups whose summed
/// `delete_length * insert_length` stays within `limit`
///
/// A block costlier than the limit on its own gets a group of its own.
pub fn group_by_cost(blocks: Vec<BlockToAnalyze>, limit: usize) -> Vec<Vec<BlockToAnalyze>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut cost = 0;

    for block in blocks {
        let block_cost = block.delete_length * block.insert_length;
        if !current.is_empty() && cost + block_cost > limit {
            groups.push(std::mem::take(&mut current));
            cost = 0;
        }
        cost += block_cost;
        current.push(block);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}
