//! Inter-line alignment of modified blocks
//!
//! The analysis string pairs old lines with the new lines they most likely
//! became: `;`-separated `OLD=NEW` entries (0-based offsets inside the block),
//! each optionally followed by `:` and `,`-separated character edits
//! `dA-B` (deleted from old), `iA-B` (inserted into new) or `rA-B=C-D`
//! (replaced). Character offsets count Unicode scalar values.

use similar::{DiffOp, TextDiff};

/// Lines less similar than this are never paired
const PAIR_THRESHOLD: f32 = 0.5;

/// Blocks larger than this many line pairs are left unaligned
const MAX_ALIGNMENT_CELLS: usize = 1_000_000;

fn similarity(old: &str, new: &str) -> f32 {
    if old.trim() == new.trim() {
        return 1.0;
    }
    TextDiff::from_chars(old, new).ratio()
}

/// Monotone pairing of old and new lines maximising total similarity
pub fn align_lines(old: &[&str], new: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (old.len(), new.len());
    if n == 0 || m == 0 || n.saturating_mul(m) > MAX_ALIGNMENT_CELLS {
        return Vec::new();
    }

    let mut scores = vec![vec![0f32; m + 1]; n + 1];
    let mut paired = vec![vec![false; m + 1]; n + 1];

    for i in 1..=n {
        for j in 1..=m {
            let mut best = scores[i - 1][j].max(scores[i][j - 1]);
            let sim = similarity(old[i - 1], new[j - 1]);
            if sim >= PAIR_THRESHOLD && scores[i - 1][j - 1] + sim > best {
                best = scores[i - 1][j - 1] + sim;
                paired[i][j] = true;
            }
            scores[i][j] = best;
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        if paired[i][j] {
            pairs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if scores[i - 1][j] >= scores[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    pairs.reverse();
    pairs
}

/// Character edits turning `old` into `new`
pub fn line_edits(old: &str, new: &str) -> Vec<String> {
    let diff = TextDiff::from_chars(old, new);
    diff.ops()
        .iter()
        .filter_map(|op| match *op {
            DiffOp::Equal { .. } => None,
            DiffOp::Delete {
                old_index, old_len, ..
            } => Some(format!("d{}-{}", old_index, old_index + old_len)),
            DiffOp::Insert {
                new_index, new_len, ..
            } => Some(format!("i{}-{}", new_index, new_index + new_len)),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => Some(format!(
                "r{}-{}={}-{}",
                old_index,
                old_index + old_len,
                new_index,
                new_index + new_len
            )),
        })
        .collect()
}

/// Analysis string for one block
pub fn analyze_block(old: &[&str], new: &[&str]) -> String {
    align_lines(old, new)
        .into_iter()
        .map(|(o, n)| {
            let edits = line_edits(old[o], new[n]);
            if edits.is_empty() {
                format!("{}={}", o, n)
            } else {
                format!("{}={}:{}", o, n, edits.join(","))
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}
