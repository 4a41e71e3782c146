//! Character-level diff between two snapshots of the same text.
//!
//! Produces the shortest edit script (Myers, O((N+M)·D)) over Unicode scalar
//! values, expressed as single-character operations at UTF-8 byte offsets:
//!
//! ```text
//! old: "hello"          ops, in application order:
//! new: "jello!"           Delete { offset: 0, len: 1 }      // 'h'
//!                         Insert { offset: 0, text: "j" }
//!                         Insert { offset: 5, text: "!" }
//! ```
//!
//! Removals come first, highest offset to lowest, with offsets into the old
//! text. Insertions follow, lowest offset to highest, with offsets into the new
//! text. Applied in that order every offset is valid at the moment it is used.
//!
//! Reference: Myers, "An O(ND) Difference Algorithm and Its Variations" (1986)

use crate::error::TextError;

/// Edit distances above this (after trimming the common prefix and suffix)
/// fall back to replacing the whole differing middle.
pub const MAX_EDIT_DISTANCE: usize = 1024;

/// A single edit against a text buffer, in UTF-8 byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    /// Insert `text` (one character) before byte `offset`.
    Insert { offset: usize, text: String },
    /// Remove `len` bytes (one character) starting at byte `offset`.
    Delete { offset: usize, len: usize },
}

impl EditOp {
    pub fn offset(&self) -> usize {
        match self {
            EditOp::Insert { offset, .. } | EditOp::Delete { offset, .. } => *offset,
        }
    }

    /// Number of bytes inserted or removed.
    pub fn byte_len(&self) -> usize {
        match self {
            EditOp::Insert { text, .. } => text.len(),
            EditOp::Delete { len, .. } => *len,
        }
    }
}

/// Compute the ordered operations that turn `old` into `new`.
///
/// Returns an empty vector when the texts are equal.
pub fn diff(old: &str, new: &str) -> Vec<EditOp> {
    if old == new {
        return Vec::new();
    }

    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let (mut removed, mut inserted) = match shortest_edit(a_mid, b_mid) {
        Some(script) => script,
        None => {
            log::debug!(
                "edit distance above {MAX_EDIT_DISTANCE}, replacing {} chars with {}",
                a_mid.len(),
                b_mid.len()
            );
            ((0..a_mid.len()).collect(), (0..b_mid.len()).collect())
        }
    };

    removed.sort_unstable_by(|x, y| y.cmp(x));
    inserted.sort_unstable();

    let old_offsets = byte_offsets(old);
    let new_offsets = byte_offsets(new);

    let mut ops = Vec::with_capacity(removed.len() + inserted.len());
    for i in removed {
        let idx = prefix + i;
        ops.push(EditOp::Delete {
            offset: old_offsets[idx],
            len: a[idx].len_utf8(),
        });
    }
    for j in inserted {
        let idx = prefix + j;
        ops.push(EditOp::Insert {
            offset: new_offsets[idx],
            text: b[idx].to_string(),
        });
    }
    ops
}

/// Apply `ops` in order to a plain string.
///
/// Used to validate an edit before it touches a replicated store and as the
/// reference semantics for tests.
pub fn apply_ops(text: &str, ops: &[EditOp]) -> Result<String, TextError> {
    let mut out = text.to_string();
    for op in ops {
        match op {
            EditOp::Insert { offset, text } => {
                check_range(&out, *offset, 0)?;
                out.insert_str(*offset, text);
            }
            EditOp::Delete { offset, len } => {
                check_range(&out, *offset, *len)?;
                out.replace_range(*offset..*offset + *len, "");
            }
        }
    }
    Ok(out)
}

/// Verify that `[offset, offset + len)` lies inside `text` on char boundaries.
pub(crate) fn check_range(text: &str, offset: usize, len: usize) -> Result<(), TextError> {
    let end = offset.checked_add(len).ok_or(TextError::OutOfRange {
        offset,
        len,
        doc_len: text.len(),
    })?;
    if end > text.len() {
        return Err(TextError::OutOfRange {
            offset,
            len,
            doc_len: text.len(),
        });
    }
    if !text.is_char_boundary(offset) {
        return Err(TextError::NotCharBoundary { offset });
    }
    if !text.is_char_boundary(end) {
        return Err(TextError::NotCharBoundary { offset: end });
    }
    Ok(())
}

/// Byte offset of every char, plus the total length as a sentinel.
fn byte_offsets(text: &str) -> Vec<usize> {
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    offsets.push(text.len());
    offsets
}

/// Myers forward search with a compact trace, then backtrack.
///
/// Returns `(removed old indices, inserted new indices)` or `None` when the
/// edit distance exceeds [`MAX_EDIT_DISTANCE`].
fn shortest_edit(a: &[char], b: &[char]) -> Option<(Vec<usize>, Vec<usize>)> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    if n == 0 || m == 0 {
        return Some(((0..a.len()).collect(), (0..b.len()).collect()));
    }

    let max = (n + m).min(MAX_EDIT_DISTANCE as isize);
    let off = n + m;
    let mut v = vec![0isize; (2 * off + 2) as usize];
    // trace[d] holds v[-d..=d] as it was before step d.
    let mut trace: Vec<Vec<isize>> = Vec::new();

    let mut found = None;
    'search: for d in 0..=max {
        trace.push(v[(off - d) as usize..=(off + d) as usize].to_vec());
        let mut k = -d;
        while k <= d {
            let idx = (k + off) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                found = Some(d);
                break 'search;
            }
            k += 2;
        }
    }
    let depth = found?;

    let mut removed = Vec::new();
    let mut inserted = Vec::new();
    let (mut x, mut y) = (n, m);
    for d in (0..=depth).rev() {
        let snapshot = &trace[d as usize];
        let at = |k: isize| snapshot[(k + d) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { at(prev_k) };
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                inserted.push(prev_y as usize);
            } else {
                removed.push(prev_x as usize);
            }
        }
        x = prev_x;
        y = prev_y;
    }

    Some((removed, inserted))
}
