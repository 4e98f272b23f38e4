//! Post reference formatting for quoting.

use frames::PostId;

/// Text to insert after `old` when quoting post `id`.
///
/// `already_linked` is true when the previous quote targeted the same post;
/// the `>>id` link is then omitted and only the selection is appended. Each
/// selected line is prefixed with `>`.
#[must_use]
pub fn reference(old: &str, id: PostId, selection: &str, already_linked: bool) -> String {
    let new_line = old.is_empty() || old.ends_with('\n');
    let mut out = String::new();

    if !already_linked {
        if !new_line {
            if !selection.is_empty() {
                out.push('\n');
            } else if !old.ends_with(' ') {
                out.push(' ');
            }
        }
        out.push_str(&format!(">>{id} "));
    }

    if selection.is_empty() {
        if new_line {
            out.push('\n');
        }
    } else {
        if !already_linked || !new_line {
            out.push('\n');
        }
        for line in selection.split('\n') {
            out.push('>');
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
