//! C3 — billing calculator: converts token counts + model + multiplier into
//! a cost breakdown. Grounded on the teacher's `pricing::cost_usd` and
//! `forward::context::ForwardContext::calculate_cost`.

use crate::model::{CostBreakdown, PricingEntry, TokenUsage};

/// `actual_cost = total_cost * max(multiplier, 1.0)` per spec.md §3 — a
/// multiplier `<= 0` is coerced to `1.0`.
pub fn calculate(entry: &PricingEntry, usage: &TokenUsage, rate_multiplier: f64) -> CostBreakdown {
    let input_cost = usage.input_tokens as f64 * entry.input_per_token;
    let output_cost = usage.output_tokens as f64 * entry.output_per_token;

    let cache_creation_cost = if let Some(p5m) = entry.cache_creation_5m_per_token {
        // Split 5-minute / 1-hour cache-write pricing, spec.md §4.1: "unless
        // an entry has 5-minute / 1-hour split prices". Absent a signal for
        // which bucket a given write used, price the conservative (5 min) tier.
        usage.cache_creation_input_tokens as f64 * p5m
    } else {
        usage.cache_creation_input_tokens as f64 * entry.cache_creation_per_token
    };
    let _ = entry.cache_creation_1h_per_token; // reserved for a future split-aware caller

    let cache_read_cost = usage.cache_read_input_tokens as f64 * entry.cache_read_per_token;

    let total_cost = input_cost + output_cost + cache_creation_cost + cache_read_cost;
    let multiplier = if rate_multiplier > 0.0 { rate_multiplier } else { 1.0 };
    let actual_cost = total_cost * multiplier.max(1.0);

    CostBreakdown { input_cost, output_cost, cache_creation_cost, cache_read_cost, total_cost, actual_cost }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_cost_is_sum_of_components() {
        let entry = PricingEntry {
            input_per_token: 0.000003,
            output_per_token: 0.000015,
            cache_creation_per_token: 0.00000375,
            cache_read_per_token: 0.0000003,
            ..Default::default()
        };
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
            cache_creation_input_tokens: 200,
            cache_read_input_tokens: 300,
        };
        let cost = calculate(&entry, &usage, 1.0);
        let expected = cost.input_cost + cost.output_cost + cost.cache_creation_cost + cost.cache_read_cost;
        assert!((cost.total_cost - expected).abs() < 1e-9);
    }

    #[test]
    fn multiplier_below_one_is_coerced() {
        let entry = PricingEntry { input_per_token: 1.0, ..Default::default() };
        let usage = TokenUsage { input_tokens: 10, ..Default::default() };
        let cost = calculate(&entry, &usage, 0.5);
        assert!((cost.actual_cost - cost.total_cost).abs() < 1e-9);
    }

    #[test]
    fn non_positive_multiplier_coerced_to_one() {
        let entry = PricingEntry { input_per_token: 2.0, ..Default::default() };
        let usage = TokenUsage { input_tokens: 10, ..Default::default() };
        let cost = calculate(&entry, &usage, -5.0);
        assert!((cost.actual_cost - cost.total_cost).abs() < 1e-9);
    }

    #[test]
    fn multiplier_above_one_scales_actual_cost() {
        let entry = PricingEntry { input_per_token: 1.0, ..Default::default() };
        let usage = TokenUsage { input_tokens: 10, ..Default::default() };
        let cost = calculate(&entry, &usage, 2.0);
        assert!((cost.actual_cost - cost.total_cost * 2.0).abs() < 1e-9);
    }
}
