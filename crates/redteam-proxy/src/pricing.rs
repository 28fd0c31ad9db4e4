//! Static model pricing table.
//!
//! Maps model names to per-million-token input/output rates and computes the
//! per-request cost in USD, truncated to 8 decimals. Unknown models fall
//! back to the default (`gpt-4o`) rates. Lookup tries an exact match first,
//! then the longest matching prefix, so `gpt-4o-2024-08-06` resolves to the
//! `gpt-4o` entry.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Model used when the requested model has no pricing entry.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Pricing entry for a model: USD per 1 million input and output tokens.
#[derive(Debug, Clone, Copy)]
struct Pricing {
    input_per_million: f64,
    output_per_million: f64,
}

static PRICING_TABLE: Lazy<HashMap<&'static str, Pricing>> = Lazy::new(|| {
    let mut m = HashMap::new();
    let mut add = |model, input, output| {
        m.insert(
            model,
            Pricing {
                input_per_million: input,
                output_per_million: output,
            },
        );
    };

    // OpenAI
    add("gpt-4o-mini", 0.15, 0.60);
    add("gpt-4o", 2.50, 10.0);
    add("gpt-4-turbo", 10.0, 30.0);
    add("gpt-4", 30.0, 60.0);
    add("gpt-3.5-turbo", 0.50, 1.50);
    add("o1-mini", 1.10, 4.40);
    add("o1", 15.0, 60.0);

    // Anthropic
    add("claude-3-5-sonnet", 3.0, 15.0);
    add("claude-3.5-sonnet", 3.0, 15.0);
    add("claude-3-5-haiku", 0.80, 4.0);
    add("claude-3.5-haiku", 0.80, 4.0);
    add("claude-3-opus", 15.0, 75.0);
    add("claude-3-haiku", 0.25, 1.25);

    m
});

/// Compute the cost of a request in USD, truncated to 8 decimals.
///
/// `cost = prompt_tokens · input_rate + completion_tokens · output_rate`,
/// always ≥ 0.
pub fn cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    let pricing = lookup(model);
    let raw = prompt_tokens as f64 * pricing.input_per_million / 1_000_000.0
        + completion_tokens as f64 * pricing.output_per_million / 1_000_000.0;
    truncate_8dp(raw)
}

fn lookup(model: &str) -> Pricing {
    let lower = model.to_lowercase();
    if let Some(p) = PRICING_TABLE.get(lower.as_str()) {
        return *p;
    }

    // Longest prefix wins: claude-3-5-sonnet-20241022 → claude-3-5-sonnet
    let mut best: Option<(&str, Pricing)> = None;
    for (prefix, pricing) in PRICING_TABLE.iter() {
        if lower.starts_with(prefix) {
            match best {
                Some((existing, _)) if existing.len() >= prefix.len() => {}
                _ => best = Some((prefix, *pricing)),
            }
        }
    }
    if let Some((_, pricing)) = best {
        return pricing;
    }

    PRICING_TABLE[DEFAULT_MODEL]
}

/// Truncate to 8 decimal places. A tiny epsilon absorbs binary
/// representation error so values like 0.0075 don't truncate down to
/// 0.00749999.
fn truncate_8dp(value: f64) -> f64 {
    ((value * 1e8) + 1e-4).trunc() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-10,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_gpt_4o_rates() {
        // 1000 prompt + 500 completion on gpt-4o:
        // 1000·2.5e-6 + 500·1e-5 = 0.0025 + 0.005
        assert_close(cost("gpt-4o", 1000, 500), 0.0075);
    }

    #[test]
    fn test_unknown_model_uses_default_rates() {
        assert_close(
            cost("my-custom-model", 1000, 500),
            cost(DEFAULT_MODEL, 1000, 500),
        );
        assert_close(cost("my-custom-model", 1, 1), 0.0000125);
    }

    #[test]
    fn test_prefix_match() {
        assert_close(
            cost("gpt-4o-2024-08-06", 100, 100),
            cost("gpt-4o", 100, 100),
        );
        assert_close(
            cost("claude-3-5-sonnet-20241022", 100, 100),
            cost("claude-3-5-sonnet", 100, 100),
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        // gpt-4o-mini-2024 must hit gpt-4o-mini, not gpt-4o
        assert_close(
            cost("gpt-4o-mini-2024-07-18", 1_000_000, 0),
            0.15,
        );
    }

    #[test]
    fn test_zero_tokens_zero_cost() {
        assert_close(cost("gpt-4o", 0, 0), 0.0);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        assert_close(cost("GPT-4o", 1000, 500), cost("gpt-4o", 1000, 500));
    }

    #[test]
    fn test_cost_is_never_negative() {
        assert!(cost("gpt-4", 0, 0) >= 0.0);
        assert!(cost("gpt-4", u32::MAX, u32::MAX) >= 0.0);
    }

    #[test]
    fn test_truncation_to_8_decimals() {
        // 7 tokens of gpt-4o-mini input: 7·0.15e-6 = 0.00000105
        assert_close(cost("gpt-4o-mini", 7, 0), 0.00000105);
        // 1 token input on gpt-4o-mini = 1.5e-7 = 0.00000015
        assert_close(cost("gpt-4o-mini", 1, 0), 0.00000015);
        // A value with digits beyond 8 decimals truncates, not rounds:
        // 3 tokens of claude-3-haiku input = 3·0.25e-6 = 7.5e-7
        assert_close(cost("claude-3-haiku", 3, 0), 0.00000075);
    }

    #[test]
    fn test_truncate_8dp_guard() {
        assert_close(truncate_8dp(0.0075), 0.0075);
        assert_close(truncate_8dp(0.123456789), 0.12345678);
        assert_close(truncate_8dp(0.0), 0.0);
    }
}
