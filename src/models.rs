use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Quality/cost class a step asks for, decoupled from concrete model churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Cheap,
    Medium,
    Expensive,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Cheap => "cheap",
            ModelTier::Medium => "medium",
            ModelTier::Expensive => "expensive",
        }
    }
}

/// Concrete model identifier with its price table.
///
/// Prices are USD per 1K tokens, matching how providers publish them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, input_price_per_1k: f64, output_price_per_1k: f64) -> Self {
        Self {
            id: id.into(),
            input_price_per_1k,
            output_price_per_1k,
        }
    }

    /// Dollar cost of one invocation.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_price_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_price_per_1k
    }
}

/// Deserializable tier configuration, loaded once at process start.
///
/// Every tier is optional here so partial config files parse; the gap is
/// caught when building the [`TierTable`], which is where "fatal at
/// startup" lives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierConfig {
    pub cheap: Option<ModelDescriptor>,
    pub medium: Option<ModelDescriptor>,
    pub expensive: Option<ModelDescriptor>,
}

/// Immutable tier → model mapping.
///
/// Built once, never mutated; `resolve` is a pure lookup with no failure
/// path because construction already guaranteed all three tiers exist.
#[derive(Debug, Clone)]
pub struct TierTable {
    cheap: ModelDescriptor,
    medium: ModelDescriptor,
    expensive: ModelDescriptor,
}

impl TierTable {
    pub fn from_config(config: TierConfig) -> Result<Self> {
        let require = |tier: ModelTier, slot: Option<ModelDescriptor>| {
            slot.ok_or_else(|| {
                PipelineError::Configuration(format!("No model mapped for tier '{}'", tier.as_str()))
            })
        };
        Ok(Self {
            cheap: require(ModelTier::Cheap, config.cheap)?,
            medium: require(ModelTier::Medium, config.medium)?,
            expensive: require(ModelTier::Expensive, config.expensive)?,
        })
    }

    /// Default table for a local Ollama install. Prices are nominal (local
    /// inference is free) but non-zero so cost accounting stays exercised.
    pub fn ollama_default() -> Self {
        Self {
            cheap: ModelDescriptor::new("llama3.2:1b", 0.0001, 0.0002),
            medium: ModelDescriptor::new("llama3.1:8b", 0.0005, 0.001),
            expensive: ModelDescriptor::new("deepseek-r1:14b", 0.002, 0.004),
        }
    }

    pub fn resolve(&self, tier: ModelTier) -> &ModelDescriptor {
        match tier {
            ModelTier::Cheap => &self.cheap,
            ModelTier::Medium => &self.medium,
            ModelTier::Expensive => &self.expensive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("test-model", 0.5, 2.0)
    }

    #[test]
    fn test_cost_formula() {
        let d = descriptor();
        // 1000 input at $0.5/1K + 500 output at $2.0/1K = 0.5 + 1.0
        let cost = d.cost(1000, 500);
        assert!((cost - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_cost_zero_tokens() {
        assert_eq!(descriptor().cost(0, 0), 0.0);
    }

    #[test]
    fn test_tier_table_missing_tier_is_configuration_error() {
        let config = TierConfig {
            cheap: Some(descriptor()),
            medium: None,
            expensive: Some(descriptor()),
        };
        match TierTable::from_config(config) {
            Err(PipelineError::Configuration(msg)) => assert!(msg.contains("medium")),
            other => panic!("Expected Configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tier_table_resolve() {
        let table = TierTable::from_config(TierConfig {
            cheap: Some(ModelDescriptor::new("c", 0.1, 0.2)),
            medium: Some(ModelDescriptor::new("m", 0.3, 0.4)),
            expensive: Some(ModelDescriptor::new("e", 0.5, 0.6)),
        })
        .unwrap();
        assert_eq!(table.resolve(ModelTier::Cheap).id, "c");
        assert_eq!(table.resolve(ModelTier::Medium).id, "m");
        assert_eq!(table.resolve(ModelTier::Expensive).id, "e");
    }

    #[test]
    fn test_tier_config_from_json() {
        let config: TierConfig = serde_json::from_str(
            r#"{
                "cheap": {"id": "small", "input_price_per_1k": 0.0001, "output_price_per_1k": 0.0002},
                "medium": {"id": "mid", "input_price_per_1k": 0.001, "output_price_per_1k": 0.002},
                "expensive": {"id": "big", "input_price_per_1k": 0.01, "output_price_per_1k": 0.03}
            }"#,
        )
        .unwrap();
        let table = TierTable::from_config(config).unwrap();
        assert_eq!(table.resolve(ModelTier::Expensive).id, "big");
    }
}
