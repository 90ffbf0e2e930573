use std::collections::HashMap;

use serde::Serialize;
use tollgate_core::ApiError;
use tollgate_store::types::ModelInfo;
use tollgate_store::Db;
use tracing::info;

/// Cost of one completion at the model's catalog rates.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CostEstimate {
    pub prompt_cost: f64,
    pub completion_cost: f64,
    pub total_cost: f64,
}

/// In-memory snapshot of the model catalog: name → provider tag, pricing,
/// context window. Loaded once at startup and read-only afterwards;
/// catalog changes take a restart.
pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    /// Load every enabled model from the catalog table.
    pub fn load(db: &Db) -> tollgate_store::Result<Self> {
        let models = db.with_conn(tollgate_store::models::enabled_models)?;
        info!(count = models.len(), "model registry loaded");
        Ok(Self::from_models(models))
    }

    pub fn from_models(models: Vec<ModelInfo>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelInfo> {
        self.models.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// All models, name-sorted for stable listings.
    pub fn all(&self) -> Vec<&ModelInfo> {
        let mut models: Vec<&ModelInfo> = self.models.values().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resolve a model name or fail with the list of valid choices.
    pub fn validate(&self, name: &str) -> Result<&ModelInfo, ApiError> {
        self.get(name).ok_or_else(|| {
            let available: Vec<&str> = self.all().iter().map(|m| m.name.as_str()).collect();
            ApiError::Validation(format!(
                "Invalid model_name '{name}'. Available models: {}",
                available.join(", ")
            ))
        })
    }

    /// Dollar cost at catalog rates: tokens / 1000 × rate.
    pub fn estimate_cost(
        &self,
        name: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Option<CostEstimate> {
        let model = self.get(name)?;
        let prompt_cost = prompt_tokens as f64 / 1000.0 * model.prompt_price;
        let completion_cost = completion_tokens as f64 / 1000.0 * model.completion_price;
        Some(CostEstimate {
            prompt_cost,
            completion_cost,
            total_cost: prompt_cost + completion_cost,
        })
    }
}

/// Tokenizer-free estimate used for admission checks: roughly four
/// characters per token, never zero.
pub fn estimate_tokens(text: &str) -> u32 {
    std::cmp::max(1, text.len() / 4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        let db = Db::open_in_memory().unwrap();
        ModelRegistry::load(&db).unwrap()
    }

    #[test]
    fn loads_seeded_catalog() {
        let registry = registry();
        assert!(registry.exists("gpt-3.5-turbo"));
        assert!(registry.exists("GigaChat"));
        let model = registry.get("claude-3-5-sonnet-20241022").unwrap();
        assert_eq!(model.provider, "anthropic");
        assert_eq!(model.context_window, 200_000);

        let names: Vec<&str> = registry.all().iter().map(|m| m.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn validate_lists_available_models() {
        let registry = registry();
        assert!(registry.validate("gpt-4o").is_ok());
        let err = registry.validate("gpt-9").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("gpt-3.5-turbo"));
    }

    #[test]
    fn cost_uses_per_thousand_rates() {
        let registry = registry();
        // gpt-3.5-turbo: 0.0005 prompt / 0.0015 completion per 1k
        let cost = registry.estimate_cost("gpt-3.5-turbo", 2000, 1000).unwrap();
        assert!((cost.prompt_cost - 0.001).abs() < 1e-9);
        assert!((cost.completion_cost - 0.0015).abs() < 1e-9);
        assert!((cost.total_cost - 0.0025).abs() < 1e-9);
        assert!(registry.estimate_cost("missing", 1, 1).is_none());
    }

    #[test]
    fn token_estimate_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(100)), 25);
    }
}
