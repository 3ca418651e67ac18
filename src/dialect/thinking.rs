//! Strips "thinking" token blocks from content so the client never sees
//! them (spec.md §4.3). Patterns are data, not code (design note 9): each
//! regex is a `&'static str` in a table, compiled once behind
//! `once_cell::sync::Lazy`.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

/// Paired tags: `<think>…</think>`, `<thinking>…</thinking>`,
/// `<thought>…</thought>`, `<antthinking>…</antthinking>`.
static PAIRED_TAGS: &[&str] = &["think", "thinking", "thought", "antthinking"];

static PAIRED_TAG_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    PAIRED_TAGS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?s)<{tag}>.*?</{tag}>"))
                .unwrap_or_else(|e| panic!("thinking tag pattern for `{tag}` must compile: {e}"))
        })
        .collect()
});

/// Any stray opening/closing tag of the same names, unpaired.
static STRAY_TAG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternation = PAIRED_TAGS.join("|");
    Regex::new(&format!(r"</?(?:{alternation})>")).expect("stray tag pattern must compile")
});

/// Sentinel-wrapped blocks: `<｜begin_…｜> … <｜end_…｜>` (full-width bar
/// variants included), plus lone sentinel tokens.
static SENTINEL_BLOCK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<[｜|]begin_[^｜|]*[｜|]>.*?<[｜|]end_[^｜|]*[｜|]>")
        .expect("sentinel block pattern must compile")
});

static LONE_SENTINEL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<[｜|](?:begin|end)_[^｜|]*[｜|]>").expect("lone sentinel pattern must compile")
});

/// Quick pre-check so the common "no thinking block present" case avoids
/// running every regex in sequence.
static ANY_MARKER: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([r"<(?:think|thinking|thought|antthinking)", r"<[｜|](?:begin|end)_"])
        .expect("marker set must compile")
});

/// Remove every thinking block / stray tag / sentinel wrapper from
/// `content`. Invariant (spec.md §8 #10): the result never contains
/// `<think>`, `<thinking>`, `<｜begin`, or `<｜end`.
pub fn strip_thinking_blocks(content: &str) -> String {
    if !ANY_MARKER.is_match(content) {
        return content.to_string();
    }
    let mut out = content.to_string();
    for pattern in PAIRED_TAG_PATTERNS.iter() {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out = STRAY_TAG_PATTERN.replace_all(&out, "").into_owned();
    out = SENTINEL_BLOCK_PATTERN.replace_all(&out, "").into_owned();
    out = LONE_SENTINEL_PATTERN.replace_all(&out, "").into_owned();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_paired_think_tags() {
        let out = strip_thinking_blocks("before<think>secret plan</think>after");
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn strips_all_paired_tag_variants() {
        for tag in PAIRED_TAGS {
            let input = format!("a<{tag}>hidden</{tag}>b");
            let out = strip_thinking_blocks(&input);
            assert_eq!(out, "ab", "failed for tag {tag}");
        }
    }

    #[test]
    fn strips_stray_unpaired_tags() {
        let out = strip_thinking_blocks("start<thinking>no closer here");
        assert!(!out.contains("<thinking>"));
    }

    #[test]
    fn strips_sentinel_wrapped_blocks() {
        let out = strip_thinking_blocks("a<｜begin_of_thought｜>reasoning here<｜end_of_thought｜>b");
        assert_eq!(out, "ab");
    }

    #[test]
    fn strips_lone_sentinel_tokens() {
        let out = strip_thinking_blocks("a<｜begin_of_thought｜>b");
        assert!(!out.contains("｜begin"));
    }

    #[test]
    fn leaves_ordinary_content_untouched() {
        let out = strip_thinking_blocks("The answer is 42.");
        assert_eq!(out, "The answer is 42.");
    }

    #[test]
    fn invariant_no_marker_survives_mixed_input() {
        let input = "pre<think>x</think>mid<｜begin_a｜>y<｜end_a｜>post<thought>z";
        let out = strip_thinking_blocks(input);
        for marker in ["<think>", "<thinking>", "<｜begin", "<｜end"] {
            assert!(!out.contains(marker), "marker `{marker}` survived: {out}");
        }
    }
}
