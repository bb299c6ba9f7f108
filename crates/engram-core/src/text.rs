//! Tokenization and keyword relevance scoring.
//!
//! Both tiers index text as lowercase tokens and score matches by query
//! coverage. Tokens shorter than two characters carry no signal and are
//! dropped.

/// Minimum token length kept by the tokenizer.
const MIN_TOKEN_LEN: usize = 2;

/// Split text into lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Tokenize and deduplicate, preserving first-seen order.
pub fn unique_tokens(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of query tokens found in the candidate token set, in [0, 1].
pub fn coverage(query_tokens: &[String], matched: usize) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    (matched as f64 / query_tokens.len() as f64).min(1.0)
}
