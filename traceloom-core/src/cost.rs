// Copyright 2025 Traceloom Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cost estimation.
//!
//! Resolution order: manual override, rate card over token usage, metadata
//! cost passthrough, rate card keyed by `metadata.model`, else absent.
//! All arithmetic is exact decimal; results carry eight decimal places,
//! rounded down. A zero result is normalized to "absent" so aggregation
//! can skip it. IEEE 754 floats are never used for money.

use std::collections::HashMap;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::Value;

/// Decimal places kept on every estimate.
pub const COST_SCALE: u32 = 8;

const MILLION: Decimal = dec!(1_000_000);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CostError {
    #[error("total_estimated_cost must not be negative")]
    NegativeManual,
}

/// A derived or overridden cost. `version` names the pricing table revision
/// used; manual overrides and metadata passthroughs carry none, so later
/// price changes never silently rewrite them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostEstimate {
    pub amount: Decimal,
    pub version: Option<String>,
}

/// Per-million-token prices for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCard {
    pub input_per_1m: Decimal,
    pub output_per_1m: Decimal,
    pub cache_read_per_1m: Decimal,
    pub cache_creation_per_1m: Decimal,
}

impl RateCard {
    const fn new(input: Decimal, output: Decimal, cache_read: Decimal, cache_creation: Decimal) -> Self {
        Self {
            input_per_1m: input,
            output_per_1m: output,
            cache_read_per_1m: cache_read,
            cache_creation_per_1m: cache_creation,
        }
    }
}

/// Token counts split into the buckets a rate card prices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenBuckets {
    pub input: i64,
    pub output: i64,
    pub cache_read: i64,
    pub cache_creation: i64,
}

/// Process-wide pricing table, initialized at startup and swapped atomically
/// on config reload. Entries are ordered most-specific first; matching is a
/// case-insensitive substring on the model name, the way provider SDKs name
/// dated model snapshots.
#[derive(Debug, Clone)]
pub struct PricingTable {
    version: String,
    entries: Vec<(String, String, RateCard)>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let entries: &[(&str, &str, RateCard)] = &[
            // OpenAI
            ("openai", "gpt-4o-mini", RateCard::new(dec!(0.15), dec!(0.60), dec!(0.075), dec!(0))),
            ("openai", "gpt-4o", RateCard::new(dec!(2.50), dec!(10.0), dec!(1.25), dec!(0))),
            ("openai", "gpt-4-turbo", RateCard::new(dec!(10.0), dec!(30.0), dec!(0), dec!(0))),
            ("openai", "gpt-4", RateCard::new(dec!(30.0), dec!(60.0), dec!(0), dec!(0))),
            ("openai", "gpt-3.5-turbo", RateCard::new(dec!(0.50), dec!(1.50), dec!(0), dec!(0))),
            ("openai", "o1-preview", RateCard::new(dec!(15.0), dec!(60.0), dec!(7.50), dec!(0))),
            ("openai", "o1-mini", RateCard::new(dec!(3.0), dec!(12.0), dec!(1.50), dec!(0))),
            // Anthropic
            ("anthropic", "claude-3-5-sonnet", RateCard::new(dec!(3.0), dec!(15.0), dec!(0.30), dec!(3.75))),
            ("anthropic", "claude-3-opus", RateCard::new(dec!(15.0), dec!(75.0), dec!(1.50), dec!(18.75))),
            ("anthropic", "claude-3-sonnet", RateCard::new(dec!(3.0), dec!(15.0), dec!(0.30), dec!(3.75))),
            ("anthropic", "claude-3-haiku", RateCard::new(dec!(0.25), dec!(1.25), dec!(0.03), dec!(0.30))),
            // Google
            ("google", "gemini-1.5-pro", RateCard::new(dec!(1.25), dec!(5.0), dec!(0.3125), dec!(0))),
            ("google", "gemini-1.5-flash", RateCard::new(dec!(0.075), dec!(0.30), dec!(0.01875), dec!(0))),
            // Mistral
            ("mistralai", "mistral-large", RateCard::new(dec!(2.0), dec!(6.0), dec!(0), dec!(0))),
            ("mistralai", "mistral-small", RateCard::new(dec!(0.20), dec!(0.60), dec!(0), dec!(0))),
        ];
        Self {
            version: "2025-07-01".to_string(),
            entries: entries
                .iter()
                .map(|(p, m, r)| (p.to_string(), m.to_string(), *r))
                .collect(),
        }
    }
}

impl PricingTable {
    pub fn new(version: impl Into<String>, entries: Vec<(String, String, RateCard)>) -> Self {
        Self {
            version: version.into(),
            entries,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn lookup(&self, provider: Option<&str>, model: &str) -> Option<&RateCard> {
        let model = model.to_lowercase();
        self.entries
            .iter()
            .find(|(p, prefix, _)| {
                provider
                    .map(|given| given.eq_ignore_ascii_case(p))
                    .unwrap_or(true)
                    && model.contains(prefix.as_str())
            })
            .map(|(_, _, rates)| rates)
    }

    /// Full resolution chain; `Ok(None)` means "no cost", which callers store
    /// as absent.
    pub fn estimate(
        &self,
        model: Option<&str>,
        provider: Option<&str>,
        usage: &HashMap<String, i64>,
        metadata: Option<&Value>,
        manual: Option<Decimal>,
    ) -> Result<Option<CostEstimate>, CostError> {
        if let Some(manual) = manual {
            if manual.is_sign_negative() && !manual.is_zero() {
                return Err(CostError::NegativeManual);
            }
            if !manual.is_zero() {
                return Ok(Some(CostEstimate {
                    amount: floor_to_cost_scale(manual),
                    version: None,
                }));
            }
        }

        if let Some(model) = model {
            if let Some(estimate) = self.rate_card_estimate(provider, model, usage) {
                return Ok(Some(estimate));
            }
        }

        if let Some(amount) = metadata.and_then(metadata_cost) {
            return Ok(Some(CostEstimate {
                amount: floor_to_cost_scale(amount),
                version: None,
            }));
        }

        if let Some(model) = metadata.and_then(metadata_model) {
            if let Some(estimate) = self.rate_card_estimate(None, &model, usage) {
                return Ok(Some(estimate));
            }
        }

        Ok(None)
    }

    fn rate_card_estimate(
        &self,
        provider: Option<&str>,
        model: &str,
        usage: &HashMap<String, i64>,
    ) -> Option<CostEstimate> {
        let rates = self.lookup(provider, model)?;
        let buckets = token_buckets(usage)?;
        let amount = apply_rate_card(rates, &buckets);
        if amount.is_zero() {
            return None;
        }
        Some(CostEstimate {
            amount,
            version: Some(self.version.clone()),
        })
    }
}

fn apply_rate_card(rates: &RateCard, buckets: &TokenBuckets) -> Decimal {
    let cost = Decimal::from(buckets.input) * rates.input_per_1m / MILLION
        + Decimal::from(buckets.output) * rates.output_per_1m / MILLION
        + Decimal::from(buckets.cache_read) * rates.cache_read_per_1m / MILLION
        + Decimal::from(buckets.cache_creation) * rates.cache_creation_per_1m / MILLION;
    floor_to_cost_scale(cost)
}

/// Split the usage map into rate-card buckets. Key families are tried in
/// order of precedence; the first family with a hit wins.
pub fn token_buckets(usage: &HashMap<String, i64>) -> Option<TokenBuckets> {
    let get = |key: &str| usage.get(key).copied().unwrap_or(0);
    let has = |key: &str| usage.contains_key(key);

    // OpenAI-style keys under original_usage, cached prompt tokens deductible.
    if has("original_usage.prompt_tokens") || has("original_usage.completion_tokens") {
        let cached = get("original_usage.prompt_tokens_details.cached_tokens");
        return Some(TokenBuckets {
            input: (get("original_usage.prompt_tokens") - cached).max(0),
            output: get("original_usage.completion_tokens"),
            cache_read: cached,
            cache_creation: 0,
        });
    }

    // Anthropic-style snake_case keys.
    if has("original_usage.input_tokens") || has("original_usage.output_tokens") {
        return Some(TokenBuckets {
            input: get("original_usage.input_tokens"),
            output: get("original_usage.output_tokens"),
            cache_read: get("original_usage.cache_read_input_tokens"),
            cache_creation: get("original_usage.cache_creation_input_tokens"),
        });
    }

    // Bedrock-style camelCase keys.
    if has("original_usage.inputTokens") || has("original_usage.outputTokens") {
        return Some(TokenBuckets {
            input: get("original_usage.inputTokens"),
            output: get("original_usage.outputTokens"),
            cache_read: get("original_usage.cacheReadInputTokens"),
            cache_creation: get("original_usage.cacheWriteInputTokens"),
        });
    }

    // Unscoped legacy keys.
    if has("prompt_tokens") || has("completion_tokens") {
        return Some(TokenBuckets {
            input: get("prompt_tokens"),
            output: get("completion_tokens"),
            cache_read: 0,
            cache_creation: 0,
        });
    }
    if has("total_tokens") {
        return Some(TokenBuckets {
            input: get("total_tokens"),
            output: 0,
            cache_read: 0,
            cache_creation: 0,
        });
    }

    None
}

fn metadata_cost(metadata: &Value) -> Option<Decimal> {
    let cost = metadata.get("cost")?;
    if cost.get("currency")?.as_str()? != "USD" {
        return None;
    }
    let amount = cost.get("total_tokens")?.as_f64()?;
    let amount = Decimal::from_f64(amount)?;
    if amount <= Decimal::ZERO {
        return None;
    }
    Some(amount)
}

fn metadata_model(metadata: &Value) -> Option<String> {
    metadata.get("model")?.as_str().map(str::to_string)
}

/// Eight decimal places, rounded toward zero.
pub fn floor_to_cost_scale(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(COST_SCALE, RoundingStrategy::ToZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn usage(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn manual_override_wins() {
        let table = PricingTable::default();
        let est = table
            .estimate(
                Some("gpt-4o"),
                Some("openai"),
                &usage(&[("original_usage.prompt_tokens", 1_000)]),
                None,
                Some(dec!(1.23)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(est.amount, dec!(1.23));
        assert_eq!(est.version, None);
    }

    #[test]
    fn zero_manual_falls_through_to_derivation() {
        let table = PricingTable::default();
        let est = table
            .estimate(
                Some("gpt-4o"),
                Some("openai"),
                &usage(&[
                    ("original_usage.prompt_tokens", 1_000),
                    ("original_usage.completion_tokens", 500),
                ]),
                None,
                Some(Decimal::ZERO),
            )
            .unwrap()
            .unwrap();
        // 1000/1M * 2.50 + 500/1M * 10.0
        assert_eq!(est.amount, dec!(0.0075));
        assert_eq!(est.version.as_deref(), Some("2025-07-01"));
    }

    #[test]
    fn negative_manual_is_rejected() {
        let table = PricingTable::default();
        let err = table
            .estimate(None, None, &HashMap::new(), None, Some(dec!(-0.01)))
            .unwrap_err();
        assert_eq!(err, CostError::NegativeManual);
    }

    #[test]
    fn cached_prompt_tokens_are_deducted() {
        let b = token_buckets(&usage(&[
            ("original_usage.prompt_tokens", 1_000),
            ("original_usage.completion_tokens", 200),
            ("original_usage.prompt_tokens_details.cached_tokens", 800),
        ]))
        .unwrap();
        assert_eq!(b.input, 200);
        assert_eq!(b.cache_read, 800);
        assert_eq!(b.output, 200);
    }

    #[test]
    fn key_family_precedence_is_stable() {
        // Both families present: the prompt/completion family wins.
        let b = token_buckets(&usage(&[
            ("original_usage.prompt_tokens", 10),
            ("original_usage.input_tokens", 999),
        ]))
        .unwrap();
        assert_eq!(b.input, 10);

        let camel = token_buckets(&usage(&[
            ("original_usage.inputTokens", 5),
            ("original_usage.cacheWriteInputTokens", 7),
        ]))
        .unwrap();
        assert_eq!(camel.input, 5);
        assert_eq!(camel.cache_creation, 7);

        let total_only = token_buckets(&usage(&[("total_tokens", 42)])).unwrap();
        assert_eq!(total_only.input, 42);
        assert_eq!(total_only.output, 0);
    }

    #[test]
    fn metadata_cost_passthrough_requires_usd() {
        let table = PricingTable::default();
        let meta = json!({"cost": {"total_tokens": 0.5, "currency": "USD"}});
        let est = table
            .estimate(None, None, &HashMap::new(), Some(&meta), None)
            .unwrap()
            .unwrap();
        assert_eq!(est.amount, dec!(0.5));
        assert_eq!(est.version, None);

        let eur = json!({"cost": {"total_tokens": 0.5, "currency": "EUR"}});
        assert_eq!(
            table
                .estimate(None, None, &HashMap::new(), Some(&eur), None)
                .unwrap(),
            None
        );
    }

    #[test]
    fn metadata_model_is_the_last_resort() {
        let table = PricingTable::default();
        let meta = json!({"model": "claude-3-haiku-20240307"});
        let est = table
            .estimate(
                None,
                None,
                &usage(&[
                    ("original_usage.input_tokens", 1_000_000),
                    ("original_usage.output_tokens", 0),
                ]),
                Some(&meta),
                None,
            )
            .unwrap()
            .unwrap();
        assert_eq!(est.amount, dec!(0.25));
    }

    #[test]
    fn unknown_model_and_empty_usage_are_absent() {
        let table = PricingTable::default();
        assert_eq!(
            table
                .estimate(Some("imaginary-9b"), Some("acme"), &HashMap::new(), None, None)
                .unwrap(),
            None
        );
    }

    #[test]
    fn estimates_are_floored_at_eight_places() {
        // 1 input token of gpt-4o-mini: 0.15 / 1M = 0.00000015
        let table = PricingTable::default();
        let est = table
            .estimate(
                Some("gpt-4o-mini"),
                Some("openai"),
                &usage(&[("original_usage.prompt_tokens", 1)]),
                None,
                None,
            )
            .unwrap()
            .unwrap();
        assert_eq!(est.amount, dec!(0.00000015));
        assert!(est.amount.scale() <= COST_SCALE);
    }

    #[test]
    fn recomputation_is_bit_identical() {
        let table = PricingTable::default();
        let u = usage(&[
            ("original_usage.prompt_tokens", 123_457),
            ("original_usage.completion_tokens", 98_761),
            ("original_usage.prompt_tokens_details.cached_tokens", 1_013),
        ]);
        let a = table
            .estimate(Some("gpt-4o"), Some("openai"), &u, None, None)
            .unwrap()
            .unwrap();
        let b = table
            .estimate(Some("gpt-4o"), Some("openai"), &u, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.amount.serialize(), b.amount.serialize());
    }

    #[test]
    fn more_specific_model_names_match_first() {
        let table = PricingTable::default();
        let mini = table.lookup(Some("openai"), "gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(mini.input_per_1m, dec!(0.15));
        let full = table.lookup(Some("openai"), "gpt-4o-2024-08-06").unwrap();
        assert_eq!(full.input_per_1m, dec!(2.50));
    }
}
