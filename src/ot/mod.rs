//! Operational transform engine.
//!
//! Documents are sequences of lines; ops address the text formed by joining
//! those lines with `\n`. Positions are character offsets (Unicode scalar
//! values). Ops in a batch are applied in order, each against the state left
//! by the previous one.
//!
//! Edits run against a [`Rope`] so that large documents with many small
//! edits stay cheap: each insert or delete is logarithmic in document size.

use ropey::Rope;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A single positional edit.
///
/// On the wire an op is `{"p": 3, "i": "text"}` for inserts and
/// `{"p": 3, "d": "text"}` for deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Op {
    Insert {
        #[serde(rename = "p")]
        pos: usize,
        #[serde(rename = "i")]
        text: String,
    },
    Delete {
        #[serde(rename = "p")]
        pos: usize,
        #[serde(rename = "d")]
        text: String,
    },
}

impl Op {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Op::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(pos: usize, text: impl Into<String>) -> Self {
        Op::Delete {
            pos,
            text: text.into(),
        }
    }

    pub fn pos(&self) -> usize {
        match self {
            Op::Insert { pos, .. } | Op::Delete { pos, .. } => *pos,
        }
    }
}

/// Errors raised while applying ops
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    #[error("op position {pos} is beyond the end of the document ({len} chars)")]
    OutOfBounds { pos: usize, len: usize },

    #[error("delete at {pos} expected {expected:?} but found {found:?}")]
    ContentMismatch {
        pos: usize,
        expected: String,
        found: String,
    },
}

/// Result of applying a batch: the new content plus integrity metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub lines: Vec<String>,
    pub hash: String,
    /// UTF-8 length of the joined text
    pub byte_len: usize,
}

/// Apply `ops` to `lines`, returning the new document.
///
/// Pure: on error nothing is returned and the input is untouched.
pub fn apply(lines: &[String], ops: &[Op]) -> Result<Applied, OtError> {
    if ops.is_empty() {
        return Ok(Applied {
            lines: lines.to_vec(),
            hash: compute_hash(lines),
            byte_len: joined_len(lines),
        });
    }

    let mut rope = Rope::from_str(&lines.join("\n"));
    apply_to_rope(&mut rope, ops)?;

    let byte_len = rope.len_bytes();
    let lines = split_lines(&rope.to_string());
    let hash = compute_hash(&lines);

    Ok(Applied {
        lines,
        hash,
        byte_len,
    })
}

/// Apply `ops` in place. On error the rope keeps the ops applied so far.
pub fn apply_to_rope(rope: &mut Rope, ops: &[Op]) -> Result<(), OtError> {
    for op in ops {
        apply_op(rope, op)?;
    }
    Ok(())
}

fn apply_op(rope: &mut Rope, op: &Op) -> Result<(), OtError> {
    let len = rope.len_chars();
    match op {
        Op::Insert { pos, text } => {
            if *pos > len {
                return Err(OtError::OutOfBounds { pos: *pos, len });
            }
            rope.insert(*pos, text);
        }
        Op::Delete { pos, text } => {
            if *pos > len {
                return Err(OtError::OutOfBounds { pos: *pos, len });
            }
            let end = pos.saturating_add(text.chars().count());
            if end > len {
                return Err(OtError::ContentMismatch {
                    pos: *pos,
                    expected: text.clone(),
                    found: rope.slice(*pos..len).to_string(),
                });
            }
            let found = rope.slice(*pos..end);
            if found != text.as_str() {
                return Err(OtError::ContentMismatch {
                    pos: *pos,
                    expected: text.clone(),
                    found: found.to_string(),
                });
            }
            rope.remove(*pos..end);
        }
    }
    Ok(())
}

/// Content digest: SHA-256 over each line followed by `\n`, hex encoded.
pub fn compute_hash(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// UTF-8 length of the document text, newlines included.
pub fn joined_len(lines: &[String]) -> usize {
    let newlines = lines.len().saturating_sub(1);
    lines.iter().map(String::len).sum::<usize>() + newlines
}

fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_owned).collect()
}

/// Ops that turn `old` into `new`: one delete of the differing middle
/// followed by one insert, around the common prefix and suffix.
pub fn diff_lines(old: &[String], new: &[String]) -> Vec<Op> {
    let old: Vec<char> = old.join("\n").chars().collect();
    let new: Vec<char> = new.join("\n").chars().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed: String = old[prefix..old.len() - suffix].iter().collect();
    let inserted: String = new[prefix..new.len() - suffix].iter().collect();

    let mut ops = Vec::with_capacity(2);
    if !removed.is_empty() {
        ops.push(Op::delete(prefix, removed));
    }
    if !inserted.is_empty() {
        ops.push(Op::insert(prefix, inserted));
    }
    ops
}
