//! Keeps a local cursor or selection on the same content when a remote
//! update rewrites the buffer underneath it.
//!
//! Policy, per op (offsets into the text as it stands when the op applies):
//!
//! | op               | position                      | range          | bare caret |
//! |------------------|-------------------------------|----------------|------------|
//! | insert `n` bytes | `offset > upper`              | unchanged      | unchanged  |
//! | insert `n` bytes | `lower <= offset < upper`     | `upper += n`   | shift `+n` |
//! | insert `n` bytes | otherwise                     | shift `+n`     | shift `+n` |
//! | delete `n` bytes | `offset >= upper`             | unchanged      | unchanged  |
//! | delete `n` bytes | `lower <= offset < upper`     | `upper -= n`   | shift `-n` |
//! | delete `n` bytes | otherwise                     | shift `-n`     | shift `-n` |
//!
//! A caret sitting where someone typed moves past the insertion; a selection
//! that contains the edited region grows or shrinks with it.

use crate::diff::{self, EditOp};

/// Half-open byte range `[lower, upper)` into the local text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub lower: usize,
    pub upper: usize,
}

impl Selection {
    /// Build a selection; the bounds are swapped if given backwards.
    pub fn new(lower: usize, upper: usize) -> Self {
        if lower <= upper {
            Self { lower, upper }
        } else {
            Self { lower: upper, upper: lower }
        }
    }

    /// Empty selection at `offset`.
    pub fn caret(offset: usize) -> Self {
        Self { lower: offset, upper: offset }
    }

    pub fn is_caret(&self) -> bool {
        self.lower == self.upper
    }

    pub fn len(&self) -> usize {
        self.upper - self.lower
    }

    pub fn is_empty(&self) -> bool {
        self.is_caret()
    }

    fn contains(&self, offset: usize) -> bool {
        self.lower <= offset && offset < self.upper
    }

    /// Recompute the range after `ops` (as produced by [`diff::diff`]).
    pub fn remap(self, ops: &[EditOp]) -> Selection {
        // Decided once, up front: a range shrunk to nothing by the ops is
        // still treated as a range.
        let caret = self.is_caret();
        let mut sel = self;

        for op in ops {
            let (offset, n) = (op.offset(), op.byte_len());
            match op {
                EditOp::Insert { .. } => {
                    if offset > sel.upper {
                        continue;
                    }
                    if !caret && sel.contains(offset) {
                        sel.upper += n;
                    } else {
                        sel.lower += n;
                        sel.upper += n;
                    }
                }
                EditOp::Delete { .. } => {
                    if offset >= sel.upper {
                        continue;
                    }
                    if !caret && sel.contains(offset) {
                        sel.upper = sel.upper.saturating_sub(n).max(sel.lower);
                    } else {
                        sel.lower = sel.lower.saturating_sub(n);
                        sel.upper = sel.upper.saturating_sub(n);
                    }
                }
            }
        }
        sel
    }
}

/// Remap `selection` across a whole-text replacement `old -> new`.
///
/// Runs the translator's diff to recover the ops, remaps, then clamps the
/// result into `new` and snaps each bound back to a character boundary.
pub fn remap_selection_for_texts(selection: Selection, old: &str, new: &str) -> Selection {
    let ops = diff::diff(old, new);
    if ops.is_empty() {
        return selection;
    }
    let mapped = selection.remap(&ops);
    Selection::new(snap(new, mapped.lower), snap(new, mapped.upper))
}

fn snap(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}
