//! Deterministic token estimation.
//!
//! The window budget only has to be consistent with itself: every entry is
//! counted once with the same estimator, and prompt assembly uses the same
//! figure. The heuristic matches the usual ~4-chars-per-token rule for
//! English prose while charging short whitespace-separated symbols (log
//! fields, unit names) at least one token each.

/// Estimate the token count of `text`.
///
/// Never returns 0 for non-empty input.
pub fn estimate(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count();
    let words = text.split_whitespace().count();
    // Whichever is larger: one token per word, or one per 4 characters.
    std::cmp::max(words, chars.div_ceil(4))
}

/// Truncate `text` so that its estimated token count is at most `budget`,
/// appending a marker when anything was cut.
pub fn truncate_to(text: &str, budget: usize) -> String {
    if estimate(text) <= budget {
        return text.to_string();
    }
    // 4 chars per token, minus room for the marker.
    let keep_chars = budget.saturating_mul(4).saturating_sub(16);
    let mut out: String = text.chars().take(keep_chars).collect();
    out.push_str(" [truncated]");
    out
}
