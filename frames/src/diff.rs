//! Diff encoder: minimal edit from the last-sent body to the current one.
//!
//! DESIGN
//! ======
//! Inputs are compared as code-point sequences. One appended character is an
//! [`Edit::Append`], one removed trailing character is an [`Edit::Backspace`],
//! anything else collapses to a single [`Splice`] covering the span between
//! the common prefix and the common suffix. The suffix is measured only over
//! the tails left after the prefix, so the two never overlap.

use serde::{Deserialize, Serialize};

/// Replace `len` code points at `start` with `text`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splice {
    pub start: usize,
    pub len: usize,
    pub text: String,
}

impl Splice {
    /// Apply this splice to `body`. Out-of-range bounds are clamped.
    #[must_use]
    pub fn apply(&self, body: &str) -> String {
        let chars: Vec<char> = body.chars().collect();
        let start = self.start.min(chars.len());
        let end = start.saturating_add(self.len).min(chars.len());
        let mut out = String::with_capacity(body.len() + self.text.len());
        out.extend(&chars[..start]);
        out.push_str(&self.text);
        out.extend(&chars[end..]);
        out
    }

    /// This splice with `start` and `len` clamped to a body of `body_len`
    /// code points.
    #[must_use]
    pub fn clamped(&self, body_len: usize) -> Self {
        let start = self.start.min(body_len);
        let len = self.len.min(body_len - start);
        Self { start, len, text: self.text.clone() }
    }

    /// True when `start..start + len` lies within a body of `body_len` code points.
    #[must_use]
    pub fn in_bounds(&self, body_len: usize) -> bool {
        self.start
            .checked_add(self.len)
            .is_some_and(|end| end <= body_len)
    }
}

/// One wire-level change to a post body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Edit {
    Append(char),
    Backspace,
    Splice(Splice),
}

impl Edit {
    /// Apply the edit to `body`.
    #[must_use]
    pub fn apply(&self, body: &str) -> String {
        match self {
            Self::Append(c) => {
                let mut out = body.to_owned();
                out.push(*c);
                out
            }
            Self::Backspace => {
                let mut out = body.to_owned();
                out.pop();
                out
            }
            Self::Splice(splice) => splice.apply(body),
        }
    }
}

/// Compute the edit turning `old` into `new`, or `None` when they are equal.
#[must_use]
pub fn diff(old: &str, new: &str) -> Option<Edit> {
    if old == new {
        return None;
    }

    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    if new.len() == old.len() + 1 && new.starts_with(&old) {
        return new.last().copied().map(Edit::Append);
    }
    if old.len() == new.len() + 1 && old.starts_with(&new) {
        return Some(Edit::Backspace);
    }

    let start = old
        .iter()
        .zip(&new)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[start..]
        .iter()
        .rev()
        .zip(new[start..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    Some(Edit::Splice(Splice {
        start,
        len: old.len() - start - suffix,
        text: new[start..new.len() - suffix].iter().collect(),
    }))
}

#[cfg(test)]
#[path = "diff_test.rs"]
mod tests;
