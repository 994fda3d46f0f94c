//! Read-only model catalog.
//!
//! The catalog maps namespaced model ids (`provider/name`) to their
//! capabilities and pricing. It is loaded once at startup and shared
//! read-only across every component; routing strategies consult it for
//! feature gating, price ordering, and the fixed speed/quality rank tables.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Reserved model id that delegates model choice entirely to the router.
pub const AUTO_MODEL: &str = "auto";

/// Capability flags for a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelFeatures {
    pub vision: bool,
    pub function_calling: bool,
    pub tool_use: bool,
    pub json_mode: bool,
}

impl ModelFeatures {
    /// True iff every feature required by `other` is present in `self`.
    pub fn superset_of(&self, other: &ModelFeatures) -> bool {
        (self.vision || !other.vision)
            && (self.function_calling || !other.function_calling)
            && (self.tool_use || !other.tool_use)
            && (self.json_mode || !other.json_mode)
    }

    pub fn is_empty(&self) -> bool {
        !self.vision && !self.function_calling && !self.tool_use && !self.json_mode
    }
}

/// Immutable catalog entry for one upstream model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Namespaced id, `provider/name`
    pub id: String,
    pub provider: String,
    pub name: String,
    /// Context window in tokens
    pub context_window: u32,
    /// USD per 1e6 input tokens
    pub input_price: f64,
    /// USD per 1e6 output tokens
    pub output_price: f64,
    #[serde(default)]
    pub strengths: BTreeSet<String>,
    #[serde(default)]
    pub features: ModelFeatures,
    pub max_output_tokens: u32,
    /// Catalog-recommended fallbacks, tried by the `default` routing strategy
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl ModelInfo {
    /// Combined input + output price, the sort key for `lowest_cost` routing.
    pub fn combined_price(&self) -> f64 {
        self.input_price + self.output_price
    }
}

/// Fixed speed ranking, fastest first. Models absent from the table rank
/// after every listed model, in stable id order.
const SPEED_RANK: &[&str] = &[
    "anthropic/claude-3-haiku",
    "openai/gpt-3.5-turbo",
    "google/gemini-1.5-flash",
    "meta/llama-3-70b-instruct",
    "anthropic/claude-3-sonnet",
    "openai/gpt-4o",
    "google/gemini-1.5-pro",
    "openai/gpt-4-turbo",
    "anthropic/claude-3-opus",
];

/// Fixed quality ranking, best first. Same out-of-table rule as [`SPEED_RANK`].
const QUALITY_RANK: &[&str] = &[
    "anthropic/claude-3-opus",
    "openai/gpt-4o",
    "google/gemini-1.5-pro",
    "openai/gpt-4-turbo",
    "anthropic/claude-3-sonnet",
    "meta/llama-3-70b-instruct",
    "google/gemini-1.5-flash",
    "openai/gpt-3.5-turbo",
    "anthropic/claude-3-haiku",
];

fn rank_in(table: &[&str], id: &str) -> usize {
    table.iter().position(|m| *m == id).unwrap_or(table.len())
}

/// Position of a model in the fixed speed table (lower is faster).
pub fn speed_rank(id: &str) -> usize {
    rank_in(SPEED_RANK, id)
}

/// Position of a model in the fixed quality table (lower is better).
pub fn quality_rank(id: &str) -> usize {
    rank_in(QUALITY_RANK, id)
}

/// Process-wide read-only model catalog.
///
/// Backed by a `BTreeMap` so iteration order is the stable id order used by
/// the router's deterministic tie-breaks.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelInfo>,
}

impl ModelCatalog {
    pub fn from_models(models: impl IntoIterator<Item = ModelInfo>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// Models in stable id order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Models whose features cover `required`, in stable id order.
    pub fn eligible(&self, required: ModelFeatures) -> impl Iterator<Item = &ModelInfo> {
        self.models
            .values()
            .filter(move |m| m.features.superset_of(&required))
    }

    /// Built-in catalog covering the commonly routed upstream models.
    pub fn builtin() -> Self {
        fn model(
            id: &str,
            context_window: u32,
            input_price: f64,
            output_price: f64,
            features: ModelFeatures,
            max_output_tokens: u32,
            strengths: &[&str],
            fallbacks: &[&str],
        ) -> ModelInfo {
            let (provider, name) = id.split_once('/').expect("catalog ids are provider/name");
            ModelInfo {
                id: id.to_string(),
                provider: provider.to_string(),
                name: name.to_string(),
                context_window,
                input_price,
                output_price,
                strengths: strengths.iter().map(|s| s.to_string()).collect(),
                features,
                max_output_tokens,
                fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
            }
        }

        Self::from_models([
            model(
                "anthropic/claude-3-opus",
                200_000,
                15.0,
                75.0,
                ModelFeatures {
                    vision: true,
                    function_calling: false,
                    tool_use: true,
                    json_mode: false,
                },
                4096,
                &["reasoning", "writing", "analysis"],
                &["anthropic/claude-3-sonnet", "openai/gpt-4o"],
            ),
            model(
                "anthropic/claude-3-sonnet",
                200_000,
                3.0,
                15.0,
                ModelFeatures {
                    vision: true,
                    function_calling: false,
                    tool_use: true,
                    json_mode: false,
                },
                4096,
                &["reasoning", "writing"],
                &["anthropic/claude-3-haiku"],
            ),
            model(
                "anthropic/claude-3-haiku",
                200_000,
                0.25,
                1.25,
                ModelFeatures {
                    vision: true,
                    function_calling: false,
                    tool_use: true,
                    json_mode: false,
                },
                4096,
                &["speed", "summarization"],
                &["openai/gpt-3.5-turbo"],
            ),
            model(
                "openai/gpt-4o",
                128_000,
                5.0,
                15.0,
                ModelFeatures {
                    vision: true,
                    function_calling: true,
                    tool_use: true,
                    json_mode: true,
                },
                16_384,
                &["reasoning", "coding", "multimodal"],
                &["openai/gpt-4-turbo", "openai/gpt-3.5-turbo"],
            ),
            model(
                "openai/gpt-4-turbo",
                128_000,
                10.0,
                30.0,
                ModelFeatures {
                    vision: false,
                    function_calling: true,
                    tool_use: true,
                    json_mode: true,
                },
                4096,
                &["reasoning", "coding"],
                &["openai/gpt-3.5-turbo"],
            ),
            model(
                "openai/gpt-3.5-turbo",
                16_385,
                0.5,
                1.5,
                ModelFeatures {
                    vision: false,
                    function_calling: true,
                    tool_use: true,
                    json_mode: true,
                },
                4096,
                &["speed", "chat"],
                &[],
            ),
            model(
                "google/gemini-1.5-pro",
                1_000_000,
                3.5,
                10.5,
                ModelFeatures {
                    vision: true,
                    function_calling: true,
                    tool_use: true,
                    json_mode: true,
                },
                8192,
                &["long-context", "multimodal"],
                &["google/gemini-1.5-flash"],
            ),
            model(
                "google/gemini-1.5-flash",
                1_000_000,
                0.5,
                1.5,
                ModelFeatures {
                    vision: true,
                    function_calling: true,
                    tool_use: true,
                    json_mode: true,
                },
                8192,
                &["speed", "long-context"],
                &[],
            ),
            model(
                "meta/llama-3-70b-instruct",
                8192,
                0.9,
                0.9,
                ModelFeatures::default(),
                4096,
                &["chat", "open-weights"],
                &[],
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_superset() {
        let all = ModelFeatures {
            vision: true,
            function_calling: true,
            tool_use: true,
            json_mode: true,
        };
        let vision_only = ModelFeatures {
            vision: true,
            ..Default::default()
        };
        assert!(all.superset_of(&vision_only));
        assert!(all.superset_of(&ModelFeatures::default()));
        assert!(!vision_only.superset_of(&all));
        assert!(vision_only.superset_of(&vision_only));
    }

    #[test]
    fn test_builtin_catalog_ids_are_namespaced() {
        let catalog = ModelCatalog::builtin();
        assert!(!catalog.is_empty());
        for model in catalog.iter() {
            assert_eq!(model.id, format!("{}/{}", model.provider, model.name));
            assert!(model.combined_price() > 0.0);
        }
    }

    #[test]
    fn test_haiku_is_cheapest_builtin() {
        let catalog = ModelCatalog::builtin();
        let cheapest = catalog
            .iter()
            .min_by(|a, b| a.combined_price().partial_cmp(&b.combined_price()).unwrap())
            .unwrap();
        assert_eq!(cheapest.id, "anthropic/claude-3-haiku");
    }

    #[test]
    fn test_rank_tables() {
        assert!(speed_rank("anthropic/claude-3-haiku") < speed_rank("openai/gpt-3.5-turbo"));
        assert!(speed_rank("openai/gpt-3.5-turbo") < speed_rank("anthropic/claude-3-opus"));
        assert!(quality_rank("anthropic/claude-3-opus") < quality_rank("openai/gpt-4o"));
        // Unknown models rank last
        assert_eq!(speed_rank("acme/unknown"), 9);
    }

    #[test]
    fn test_catalog_fallbacks_resolve() {
        let catalog = ModelCatalog::builtin();
        for model in catalog.iter() {
            for fallback in &model.fallbacks {
                assert!(catalog.contains(fallback), "{} -> {}", model.id, fallback);
            }
        }
    }
}
