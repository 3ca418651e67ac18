//! Classifier (C3) — scores a user prompt against weighted signals and
//! maps the score to a [`Tier`].
//!
//! `classify` is a pure function of its inputs (spec.md §4.1, invariant 1 in
//! §8): same `(user_prompt, system_prompt, total_tokens, cfg)` always yields
//! the same `(tier, score)`. Keyword tables are `regex::RegexSet`s compiled
//! once behind `once_cell::sync::Lazy`, matching design note 9's "patterns
//! as data, not code" instruction.

use once_cell::sync::Lazy;
use regex::RegexSet;
use tiktoken_rs::cl100k_base;

use crate::config::routing::ScoringConfig;
use crate::registry::Tier;

/// One scoring dimension's contribution, kept for explainability in
/// [`ClassifyResult::signals`].
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: &'static str,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyResult {
    pub tier: Tier,
    pub score: f64,
    pub signals: Vec<Signal>,
}

/// Explicit reasoning cues — "step by step", "prove", "derive", "chain of
/// thought" and multilingual equivalents (CJK, Cyrillic, German). Spec.md
/// §4.1 dimension 1, and invariant 4 (§8): adding any of these to a SIMPLE
/// prompt must never lower the tier, which a purely additive positive
/// weight guarantees.
static REASONING_CUES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)step[- ]by[- ]step",
        r"(?i)\bprove\b",
        r"(?i)\bderive\b",
        r"(?i)chain[- ]of[- ]thought",
        r"(?i)\breason(ing)?\s+through\b",
        r"(?i)proof\s+by\s+contradiction",
        // German
        r"(?i)schritt\s+für\s+schritt",
        r"(?i)beweise\b",
        // Cyrillic: "пошагово" (step by step), "докажи" (prove)
        r"пошагово",
        r"докажи",
        // CJK: 逐步 (step by step), 证明 (prove), 推导 (derive)
        r"逐步",
        r"证明",
        r"推导",
    ])
    .expect("reasoning cue patterns must compile")
});

/// Structured-output request markers — spec.md §4.1 dimension 4.
static STRUCTURED_OUTPUT: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([r"(?i)\bjson\b", r"(?i)\byaml\b", r"(?i)\bschema\b", r"(?i)respond\s+in\s+"])
        .expect("structured-output patterns must compile")
});

/// Code-block / regex-pattern presence — spec.md §4.1 dimension 7.
static CODE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([r"```", r"(?m)^\s{4,}\S", r"[A-Za-z_][A-Za-z0-9_]*\([^)]*\)\s*\{"])
        .expect("code patterns must compile")
});

/// Leading interrogative words (and translations) — spec.md §4.1 dimension 5.
static INTERROGATIVE_LEAD: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^\s*(who|what|when|why|how|which|where)\b",
        r"(?i)^\s*(qui|quoi|quand|pourquoi|comment|où)\b",
        r"(?i)^\s*(wer|was|wann|warum|wie|wo)\b",
        r"^\s*(谁|什么|何时|为什么|怎么|哪)",
    ])
    .expect("interrogative patterns must compile")
});

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// "Greeting / trivial-answer shape" per spec.md §4.1 dimension 6: at most 3
/// tokens and no punctuation other than `?!.`.
fn is_trivial_greeting(prompt: &str) -> bool {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return false;
    }
    let token_count = trimmed.split_whitespace().count();
    if token_count > 3 {
        return false;
    }
    trimmed.chars().all(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '?' | '!' | '.'))
}

/// Count tokens in `text` using the `cl100k_base` encoding as a
/// provider-agnostic approximation (SPEC_FULL.md §4.1 supplemental).
pub fn estimate_tokens(text: &str) -> u64 {
    static BPE: Lazy<tiktoken_rs::CoreBPE> =
        Lazy::new(|| cl100k_base().expect("cl100k_base encoding must load"));
    BPE.encode_ordinary(text).len() as u64
}

/// `classify(userPrompt, systemPrompt?, totalTokens, scoringCfg) → {tier, score, signals[]}`.
///
/// `total_tokens` is interpreted as the **user-prompt-only** token count for
/// the hard COMPLEX pin (spec.md §4.1 dimension 3, invariant 3 in §8); the
/// system prompt never contributes lexical signals (invariant 2).
pub fn classify(
    user_prompt: &str,
    system_prompt: Option<&str>,
    total_tokens: u64,
    cfg: &ScoringConfig,
) -> ClassifyResult {
    let _ = system_prompt; // structural-only; never scanned for keywords (dimension exclusion)

    let mut signals = Vec::new();
    let mut score = 0.0;

    if REASONING_CUES.is_match(user_prompt) {
        signals.push(Signal { name: "reasoning_cue", weight: cfg.w_reasoning_cue });
        score += cfg.w_reasoning_cue;
    }

    let len = char_len(user_prompt);
    if len <= cfg.short_prompt_chars {
        signals.push(Signal { name: "length_short", weight: cfg.w_length_short });
        score += cfg.w_length_short;
    } else if len > cfg.long_prompt_chars {
        signals.push(Signal { name: "length_long", weight: cfg.w_length_long });
        score += cfg.w_length_long;
    }

    if total_tokens > cfg.medium_token_threshold {
        signals.push(Signal { name: "medium_tokens", weight: cfg.w_medium_tokens });
        score += cfg.w_medium_tokens;
    }

    if STRUCTURED_OUTPUT.is_match(user_prompt) {
        signals.push(Signal { name: "structured_output", weight: cfg.w_structured_output });
        score += cfg.w_structured_output;
    }

    let is_interrogative =
        user_prompt.trim_end().ends_with('?') || INTERROGATIVE_LEAD.is_match(user_prompt);
    if is_interrogative {
        signals.push(Signal { name: "interrogative", weight: cfg.w_interrogative });
        score += cfg.w_interrogative;
    }

    if is_trivial_greeting(user_prompt) {
        signals.push(Signal { name: "greeting", weight: cfg.w_greeting });
        score += cfg.w_greeting;
    }

    if CODE_PATTERNS.is_match(user_prompt) {
        signals.push(Signal { name: "code_block", weight: cfg.w_code_block });
        score += cfg.w_code_block;
    }

    // Structured-output floors the result at MEDIUM regardless of score.
    let structured_output_present = signals.iter().any(|s| s.name == "structured_output");

    let mut tier = tier_from_score(score, cfg);
    if structured_output_present && tier < Tier::Medium {
        tier = Tier::Medium;
    }

    // Hard token pin: user-prompt tokens above complex_token_threshold force
    // COMPLEX, *unless* the score already independently reached REASONING —
    // capability bias wins that conflict (spec.md §4.1 tie-breaks).
    if total_tokens > cfg.complex_token_threshold && tier < Tier::Reasoning {
        tier = Tier::Complex;
    }

    ClassifyResult { tier, score, signals }
}

fn tier_from_score(score: f64, cfg: &ScoringConfig) -> Tier {
    // Lower tier wins on an exact tie (cost bias): a score sitting exactly on
    // a cutoff must NOT cross into the tier above it, so each check is a
    // strict `>`, not `>=`.
    if score > cfg.reasoning_cutoff {
        Tier::Reasoning
    } else if score > cfg.complex_cutoff {
        Tier::Complex
    } else if score > cfg.medium_cutoff {
        Tier::Medium
    } else {
        Tier::Simple
    }
}
