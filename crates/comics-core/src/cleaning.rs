//! Normalization of the free-text `transcript` and `alt` fields.

use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::ComicRecord;

static STRIPPED_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[\]{}/]").expect("static regex"));
// Real newlines, the escaped text `\n`, and `/n`.
static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n|\\n|/n").expect("static regex"));
static ESCAPED_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\s").expect("static regex"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("static regex"));

/// Clean one text value. Empty input, and input that cleans down to nothing,
/// becomes `None`.
pub fn clean_text(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }

    let text = STRIPPED_CHARS.replace_all(raw, "");
    let text = LINE_BREAKS.replace_all(&text, " ");
    let text = ESCAPED_WHITESPACE.replace_all(&text, " ");
    let text = repunctuate(&text);
    let text = WHITESPACE_RUN.replace_all(&text, " ");
    let text = text.trim();

    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Rewrite a whitespace run of length >= 2 that is followed by an ASCII
/// uppercase letter into `". "` plus that letter, unless the character right
/// before the run is `.`, `!` or `?`.
///
/// The look-behind only inspects the single preceding character of the input,
/// so after terminal punctuation a match may still start at the run's second
/// character: `"a.   B"` becomes `"a. . B"`.
fn repunctuate(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_whitespace() {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let run_end = chars[i..]
            .iter()
            .position(|c| !c.is_whitespace())
            .map_or(chars.len(), |offset| i + offset);
        let next_is_upper = chars.get(run_end).is_some_and(char::is_ascii_uppercase);

        if !next_is_upper {
            out.extend(&chars[i..run_end]);
            i = run_end;
            continue;
        }

        let after_terminal = i > 0 && matches!(chars[i - 1], '.' | '!' | '?');
        if after_terminal || run_end - i < 2 {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        out.push_str(". ");
        out.push(chars[run_end]);
        i = run_end + 1;
    }

    out
}

/// Clean `transcript` and `alt` of every record; all other fields are left
/// untouched.
pub fn clean(records: Vec<ComicRecord>) -> Vec<ComicRecord> {
    let cleaned = records
        .into_iter()
        .map(|mut record| {
            record.transcript = record.transcript.as_deref().and_then(clean_text);
            record.alt = record.alt.as_deref().and_then(clean_text);
            record
        })
        .collect::<Vec<_>>();
    info!(records = cleaned.len(), "cleaned comic text fields");
    cleaned
}
