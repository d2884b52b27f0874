//! Cost calculation from token usage and model pricing.
//!
//! Single source of truth for API cost accounting. Prices are expressed in
//! nanodollars per token (1 USD = 1_000_000_000 nanodollars); integer math
//! avoids floating-point rounding drift in budget accounting.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

pub const NANOS_PER_USD: u64 = 1_000_000_000;

/// Model pricing in nanodollars per token.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nanos_per_token: u64,
    pub output_nanos_per_token: u64,
}

/// Convert a USD amount to nanodollars, rounding to the nearest nano.
pub fn nanos_from_usd(usd: f64) -> u64 {
    if usd <= 0.0 {
        return 0;
    }
    (usd * NANOS_PER_USD as f64).round() as u64
}

/// Format nanodollars as a USD string for log/event messages.
pub fn format_usd(nanos: u64) -> String {
    format!("${:.4}", nanos as f64 / NANOS_PER_USD as f64)
}

/// Normalize model names to canonical form for pricing lookup. Dated or
/// suffixed ids (`claude-haiku-4-5-20251001`) map to their base entry.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();
    match trimmed {
        s if s.contains("claude-haiku-4-5") || s.contains("claude-4.5-haiku") => "claude-haiku-4-5",
        s if s.contains("claude-sonnet-4-6") || s.contains("claude-4.6-sonnet") => {
            "claude-sonnet-4-6"
        }
        s if s.contains("claude-sonnet-4") => "claude-sonnet-4",
        s if s.contains("claude-opus-4-6") || s.contains("claude-4.6-opus") => "claude-opus-4-6",
        s if s.contains("claude-opus-4") => "claude-opus-4",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }
        _ => trimmed,
    }
}

/// Get pricing for a model. Returns None for unknown models (including every
/// local model, which is free).
///
/// Formula: $X per 1M tokens = X * 1000 nanodollars per token.
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    match normalize_model(model) {
        // Haiku tiers: $1/1M input, $5/1M output
        "claude-haiku-4-5" => Some(ModelPricing {
            input_nanos_per_token: 1_000,
            output_nanos_per_token: 5_000,
        }),
        "claude-3-5-haiku" => Some(ModelPricing {
            input_nanos_per_token: 800,
            output_nanos_per_token: 4_000,
        }),

        // Sonnet tiers: $3/1M input, $15/1M output
        "claude-sonnet-4-6" | "claude-sonnet-4" | "claude-3-5-sonnet" => Some(ModelPricing {
            input_nanos_per_token: 3_000,
            output_nanos_per_token: 15_000,
        }),

        // Opus tiers: $15/1M input, $75/1M output
        "claude-opus-4-6" | "claude-opus-4" => Some(ModelPricing {
            input_nanos_per_token: 15_000,
            output_nanos_per_token: 75_000,
        }),

        _ => None,
    }
}

fn warned_models() -> &'static Mutex<HashSet<String>> {
    static WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    WARNED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Calculate the cost in nanodollars for a token usage.
///
/// Unknown models cost 0 and log a warning once per model id (local models
/// are intentionally absent from the table and free).
pub fn cost_nanos(model: &str, prompt_tokens: u64, completion_tokens: u64) -> u64 {
    let Some(pricing) = pricing_for_model(model) else {
        let mut warned = warned_models().lock().unwrap();
        if warned.insert(model.to_string()) {
            tracing::warn!(model = %model, "unknown model for cost calculation, recording $0.00");
        }
        return 0;
    };

    prompt_tokens
        .saturating_mul(pricing.input_nanos_per_token)
        .saturating_add(completion_tokens.saturating_mul(pricing.output_nanos_per_token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("claude-haiku-4-5-20251001"), "claude-haiku-4-5");
        assert_eq!(normalize_model("claude-sonnet-4-6"), "claude-sonnet-4-6");
        assert_eq!(normalize_model("qwen2.5-coder:14b"), "qwen2.5-coder:14b");
    }

    #[test]
    fn test_cost_basic() {
        // Sonnet: $3/1M input, $15/1M output.
        // 1000 input + 500 output = 3_000_000 + 7_500_000 nanodollars.
        let cost = cost_nanos("claude-sonnet-4-6", 1000, 500);
        assert_eq!(cost, 10_500_000);
    }

    #[test]
    fn test_cost_small_usage_is_exact() {
        // 10 input + 1 output on Sonnet: 30_000 + 15_000 nanodollars.
        assert_eq!(cost_nanos("claude-sonnet-4-6", 10, 1), 45_000);
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        assert_eq!(cost_nanos("qwen2.5-coder:14b", 10_000, 10_000), 0);
    }

    #[test]
    fn test_nanos_from_usd() {
        assert_eq!(nanos_from_usd(1.0), NANOS_PER_USD);
        assert_eq!(nanos_from_usd(0.10), 100_000_000);
        assert_eq!(nanos_from_usd(0.0), 0);
        assert_eq!(nanos_from_usd(-3.0), 0);
    }

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(100_000_000), "$0.1000");
    }
}
