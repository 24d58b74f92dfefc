//! Model pricing and cost calculation.
//!
//! The pricing table is loaded from the seeded `models` table once at boot
//! and is immutable for the lifetime of the process. Cost is a pure function
//! over a usage report and the table.

use std::collections::HashMap;

use tracing::warn;

use crate::db;
use crate::error::ProxyError;
use crate::usage::Usage;

/// Per-1M-token USD rates for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_price: f64,
    pub output_price: f64,
    pub cache_read_price: f64,
    pub cache_write_price: f64,
}

/// Immutable model-id → rates map.
#[derive(Debug, Default)]
pub struct PricingTable {
    rates: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Load the table from the `models` table. Called once at boot.
    pub async fn load() -> Result<Self, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, input_price, output_price, cache_read_price, cache_write_price FROM models",
                (),
            )
            .await
            .map_err(|e| ProxyError::DatabaseError(format!("Failed to load pricing: {e}")))?;

        let mut rates = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                rates.insert(
                    id,
                    ModelPricing {
                        input_price: row.get::<f64>(1).unwrap_or(0.0),
                        output_price: row.get::<f64>(2).unwrap_or(0.0),
                        cache_read_price: row.get::<f64>(3).unwrap_or(0.0),
                        cache_write_price: row.get::<f64>(4).unwrap_or(0.0),
                    },
                );
            }
        }
        Ok(Self { rates })
    }

    #[cfg(test)]
    pub fn from_rates(rates: HashMap<String, ModelPricing>) -> Self {
        Self { rates }
    }

    /// Look up rates for a model id, trying the exact id first and then the
    /// normalized family id (date suffix stripped: `claude-sonnet-4-5-20250929`
    /// → `claude-sonnet-4-5`).
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(p) = self.rates.get(model) {
            return Some(p);
        }
        self.rates.get(&normalize_model_id(model))
    }

    /// Cost of a usage report in USD. Unknown model → 0.0 with a warning.
    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        let Some(pricing) = self.get(model) else {
            warn!("No pricing for model {model}; recording zero cost");
            return 0.0;
        };

        let per_million = |tokens: u64, rate: f64| tokens as f64 / 1_000_000.0 * rate;

        per_million(usage.input_tokens, pricing.input_price)
            + per_million(usage.output_tokens, pricing.output_price)
            + per_million(
                usage.cache_read_input_tokens.unwrap_or(0),
                pricing.cache_read_price,
            )
            + per_million(
                usage.cache_creation_input_tokens.unwrap_or(0),
                pricing.cache_write_price,
            )
    }
}

/// Strip a trailing -YYYYMMDD date suffix from a model id.
pub fn normalize_model_id(model: &str) -> String {
    if let Some(idx) = model.rfind('-') {
        let suffix = &model[idx + 1..];
        if suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_digit()) {
            return model[..idx].to_string();
        }
    }
    model.to_string()
}
