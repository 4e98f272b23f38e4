//! Size limits shared by the composer and the server, plus code-point helpers.
//!
//! All lengths are counted in Unicode code points, never bytes.

/// Maximum code points in a post body.
pub const MAX_POST_CHARS: usize = 2000;

/// Maximum lines in a post body. A body with `n` newlines has `n + 1` lines.
pub const MAX_POST_LINES: usize = 100;

/// Maximum code points in a thread subject.
pub const MAX_SUBJECT_CHARS: usize = 100;

/// Maximum code points in a poster name or email.
pub const MAX_NAME_CHARS: usize = 50;

/// Number of code points in `text`.
#[must_use]
pub fn char_count(text: &str) -> usize {
    text.chars().count()
}

/// Number of lines in `text`.
#[must_use]
pub fn line_count(text: &str) -> usize {
    text.chars().filter(|c| *c == '\n').count() + 1
}

/// Prefix of `text` holding at most `max` code points.
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// True when `text` is empty or contains only whitespace.
#[must_use]
pub fn is_blank(text: &str) -> bool {
    text.chars().all(char::is_whitespace)
}
