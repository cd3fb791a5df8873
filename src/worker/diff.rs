//! Line-level file comparison
//!
//! Consecutive non-equal diff operations are merged into one block, so blocks
//! are always separated by at least one unchanged line.

use crate::storage::{ChangedLines, ComparedFile};
use similar::{capture_diff_slices, Algorithm, DiffOp};
use std::collections::HashMap;

/// A modified region in absolute line numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
}

/// Split file contents into lines without their terminators
///
/// A trailing line break does not start another line; empty data has no lines.
pub fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return Vec::new();
    }
    let body = data.strip_suffix(b"\n").unwrap_or(data);
    body.split(|&b| b == b'\n').collect()
}

/// Whether the data ends with a line break
pub fn ends_with_linebreak(data: &[u8]) -> bool {
    data.last() == Some(&b'\n')
}

/// Modified regions between two line sequences
pub fn diff_blocks(old: &[&[u8]], new: &[&[u8]]) -> Vec<Block> {
    let ops = capture_diff_slices(Algorithm::Myers, old, new);

    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;

    for op in ops {
        if let DiffOp::Equal { .. } = op {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            continue;
        }

        let old_range = op.old_range();
        let new_range = op.new_range();
        match current.as_mut() {
            Some(block) => {
                block.old_len = old_range.end - block.old_start;
                block.new_len = new_range.end - block.new_start;
            }
            None => {
                current = Some(Block {
                    old_start: old_range.start,
                    old_len: old_range.len(),
                    new_start: new_range.start,
                    new_len: new_range.len(),
                });
            }
        }
    }

    if let Some(block) = current {
        blocks.push(block);
    }

    blocks
}

fn normalize(line: &[u8]) -> Vec<u8> {
    line.iter()
        .filter(|b| !b.is_ascii_whitespace())
        .copied()
        .collect()
}

/// Lines on each side not matched by a whitespace-insensitive equal line on
/// the other side
pub fn unmatched_counts(old: &[&[u8]], new: &[&[u8]]) -> (usize, usize) {
    let mut pool: HashMap<Vec<u8>, usize> = HashMap::new();
    for line in new {
        *pool.entry(normalize(line)).or_default() += 1;
    }

    let mut matched = 0;
    for line in old {
        if let Some(count) = pool.get_mut(&normalize(line)) {
            if *count > 0 {
                *count -= 1;
                matched += 1;
            }
        }
    }

    (old.len() - matched, new.len() - matched)
}

/// Turn absolute blocks into stored rows with relative offsets
pub fn changed_lines(blocks: &[Block], old: &[&[u8]], new: &[&[u8]]) -> Vec<ChangedLines> {
    let mut previous_end = 0;
    let mut rows = Vec::with_capacity(blocks.len());

    for (index, block) in blocks.iter().enumerate() {
        let old_lines = &old[block.old_start..block.old_start + block.old_len];
        let new_lines = &new[block.new_start..block.new_start + block.new_len];
        let (delete_count, insert_count) = unmatched_counts(old_lines, new_lines);

        let analysis = if block.old_len == 0 || block.new_len == 0 {
            Some(String::new())
        } else {
            None
        };

        rows.push(ChangedLines {
            index: index as i64,
            offset: (block.old_start - previous_end) as i64,
            delete_count: delete_count as i64,
            delete_length: block.old_len as i64,
            insert_count: insert_count as i64,
            insert_length: block.new_len as i64,
            analysis,
        });
        previous_end = block.old_start + block.old_len;
    }

    rows
}

/// Compare two versions of a text file
pub fn compare_file(file: i64, old_data: &[u8], new_data: &[u8]) -> ComparedFile {
    let old = split_lines(old_data);
    let new = split_lines(new_data);
    let blocks = diff_blocks(&old, &new);

    ComparedFile {
        file,
        old_linebreak: ends_with_linebreak(old_data),
        new_linebreak: ends_with_linebreak(new_data),
        blocks: changed_lines(&blocks, &old, &new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines() {
        assert!(split_lines(b"").is_empty());
        assert_eq!(split_lines(b"x\ny\nz\n"), vec![&b"x"[..], b"y", b"z"]);
        assert_eq!(split_lines(b"x\ny"), vec![&b"x"[..], b"y"]);
        assert_eq!(split_lines(b"\n"), vec![&b""[..]]);
        assert!(ends_with_linebreak(b"a\n"));
        assert!(!ends_with_linebreak(b"a"));
    }

    #[test]
    fn test_single_line_modification() {
        let compared = compare_file(1, b"x\n", b"X\n");
        assert_eq!(compared.blocks.len(), 1);
        let block = &compared.blocks[0];
        assert_eq!(block.delete_count, 1);
        assert_eq!(block.insert_count, 1);
        assert_eq!(block.analysis, None);
    }

    #[test]
    fn test_adjacent_operations_merge() {
        // delete "b", replace "c" -> "C", insert "d2": one block
        let old = split_lines(b"a\nb\nc\nd\ne\n");
        let new = split_lines(b"a\nC\nd2\nd\ne\n");
        let blocks = diff_blocks(&old, &new);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].old_start, 1);
        assert_eq!(blocks[0].old_len, 2);
        assert_eq!(blocks[0].new_len, 2);
    }

    #[test]
    fn test_blocks_partition_modified_regions() {
        let old_data = b"1\n2\n3\n4\n5\n6\n7\n8\n";
        let new_data = b"1\ntwo\n3\n4\n5\n6\nseven\nextra\n8\n";
        let compared = compare_file(9, old_data, new_data);

        assert_eq!(compared.blocks.len(), 2);
        assert_eq!(compared.blocks[0].offset, 1);
        assert_eq!(compared.blocks[0].delete_length, 1);
        assert_eq!(compared.blocks[1].offset, 4);
        assert_eq!(compared.blocks[1].delete_length, 1);
        assert_eq!(compared.blocks[1].insert_length, 2);
        assert_eq!(
            compared.blocks.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1]
        );

        // Unchanged lines plus deleted lines account for the whole old file
        let old_total: i64 = compared
            .blocks
            .iter()
            .map(|b| b.offset + b.delete_length)
            .sum();
        let trailing = 8 - old_total;
        let new_total: i64 = compared
            .blocks
            .iter()
            .map(|b| b.offset + b.insert_length)
            .sum::<i64>()
            + trailing;
        assert_eq!(new_total, 9);
    }

    #[test]
    fn test_pure_insert_needs_no_analysis() {
        let compared = compare_file(1, b"a\nb\n", b"a\nnew\nb\n");
        assert_eq!(compared.blocks.len(), 1);
        assert_eq!(compared.blocks[0].analysis.as_deref(), Some(""));
        assert_eq!(compared.blocks[0].delete_length, 0);
        assert_eq!(compared.blocks[0].insert_count, 1);
    }

    #[test]
    fn test_whitespace_insensitive_counts() {
        let old = split_lines(b"  foo\nbar\n");
        let new = split_lines(b"foo\nbaz\n");
        assert_eq!(unmatched_counts(&old, &new), (1, 1));
    }

    #[test]
    fn test_linebreak_only_change_has_no_blocks() {
        let compared = compare_file(1, b"a\nb", b"a\nb\n");
        assert!(compared.blocks.is_empty());
        assert!(!compared.old_linebreak);
        assert!(compared.new_linebreak);
    }
}
