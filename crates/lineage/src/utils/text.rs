//! Canonical comparison keys for free text.
//!
//! Both sides of a parent/child match go through [`normalize`]: the spawn
//! message a parent recorded and the opening instruction a child received.
//! Two texts are "the same instruction" iff their normalized forms are equal.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

/// Cap applied to opening instructions and spawn prefixes, in chars.
pub const DEFAULT_MAX_CHARS: usize = 192;

/// Lower-case, unwrap markup tags, collapse whitespace, truncate.
///
/// A tag is removed without leaving a separator, so `feat<b>ure</b>` reads
/// `feature`; whitespace already around a tag is kept.
///
/// Total and idempotent: `normalize(&normalize(t, n), n) == normalize(t, n)`
/// and the result never holds more than `max_len` chars. Truncation happens
/// on a grapheme boundary, so the result may be shorter than `max_len` when a
/// cluster straddles the cap.
#[must_use]
pub fn normalize(text: &str, max_len: usize) -> String {
    if text.is_empty() || max_len == 0 {
        return String::new();
    }

    let lowered = text.to_lowercase();
    let untagged = strip_tags(&lowered);
    let collapsed = untagged.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_graphemes(&collapsed, max_len)
}

#[must_use]
pub fn normalize_default(text: &str) -> String {
    normalize(text, DEFAULT_MAX_CHARS)
}

/// Length in canonical chars, the unit `max_len` is expressed in.
#[must_use]
pub fn canonical_len(text: &str) -> usize {
    text.chars().count()
}

/// Inner text of the first `<tag>...</tag>` block, if any.
///
/// An unterminated block runs to the end of the input.
#[must_use]
pub fn extract_delimited<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let rest = &text[start..];
    let inner = match rest.find(&close) {
        Some(end) => &rest[..end],
        None => rest,
    };
    let inner = inner.trim();
    if inner.is_empty() { None } else { Some(inner) }
}

/// Inner text of every `<tag>...</tag>` block, in order.
#[must_use]
pub fn extract_all_delimited<'a>(text: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut cursor = 0;
    while let Some(found) = text[cursor..].find(&open) {
        let start = cursor + found + open.len();
        let Some(length) = text[start..].find(&close) else {
            break;
        };
        let inner = text[start..start + length].trim();
        if !inner.is_empty() {
            blocks.push(inner);
        }
        cursor = start + length + close.len();
    }
    blocks
}

fn tag_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"</?[a-z][a-z0-9_:.-]*(?:\s[^<>]*)?/?>")
            .expect("markup tag regex should compile")
    })
}

// Repeats until no tag is left: removing an inner tag can complete an outer
// one (`<<b>a>` becomes `<a>`).
fn strip_tags(text: &str) -> Cow<'_, str> {
    let regex = tag_regex();
    let mut current = Cow::Borrowed(text);
    while regex.is_match(&current) {
        current = Cow::Owned(regex.replace_all(&current, "").into_owned());
    }
    current
}

fn truncate_graphemes(text: &str, max_len: usize) -> String {
    if canonical_len(text) <= max_len {
        return text.to_string();
    }

    let mut used = 0_usize;
    let mut end = 0_usize;
    for grapheme in text.graphemes(true) {
        let width = grapheme.chars().count();
        if used + width > max_len {
            break;
        }
        used += width;
        end += grapheme.len();
    }

    text[..end].trim_end().to_string()
}
