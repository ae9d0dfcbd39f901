//! Token and time budget helpers shared by the reducers and the executor boundary.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Cheap token proxy: characters divided by four, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Longest prefix of `text` whose estimate fits in `budget`, cut on a char
/// boundary. Returns the input unchanged when it already fits.
pub fn truncate_to_budget(text: &str, budget: usize) -> &str {
    if estimate_tokens(text) <= budget {
        return text;
    }
    let max_chars = budget.saturating_mul(4);
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Executor timeout derived from a unit's token budget.
pub fn timeout_for(token_budget: u32, base: Duration, per_1k_tokens: Duration) -> Duration {
    let thousands = u64::from(token_budget).div_ceil(1000);
    base + per_1k_tokens.saturating_mul(u32::try_from(thousands).unwrap_or(u32::MAX))
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("unit of work timed out"));
    }
    Ok(remaining)
}
