//! Text filtering applied to every user-supplied fragment before storage.
//!
//! Invisible and control characters are stripped (newline and tab survive),
//! then configured word filters are applied in order. Filtering can change
//! fragment length, so callers enforce size caps on the filtered text.

use std::collections::HashSet;

/// Zero-width and bidirectional override characters stripped by default.
const INVISIBLE: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}',
    '\u{202E}', '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
];

#[derive(Debug)]
pub struct TextFilter {
    excluded: HashSet<char>,
    words: Vec<(String, String)>,
}

impl TextFilter {
    /// `extra_excluded` lists additional characters to strip; `word_filters`
    /// is a `;`-separated list of `from=to` replacements.
    #[must_use]
    pub fn new(extra_excluded: &str, word_filters: &str) -> Self {
        let mut excluded: HashSet<char> = INVISIBLE.iter().copied().collect();
        excluded.extend(extra_excluded.chars().filter(|c| !c.is_whitespace()));
        Self { excluded, words: parse_word_filters(word_filters) }
    }

    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        let mut out: String = text.chars().filter(|&c| !self.is_excluded(c)).collect();
        for (from, to) in &self.words {
            if out.contains(from.as_str()) {
                out = out.replace(from.as_str(), to);
            }
        }
        out
    }

    fn is_excluded(&self, c: char) -> bool {
        (c.is_control() && c != '\n' && c != '\t') || self.excluded.contains(&c)
    }
}

fn parse_word_filters(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(from, to)| (from.trim().to_owned(), to.trim().to_owned()))
        .filter(|(from, _)| !from.is_empty())
        .collect()
}
