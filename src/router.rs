//! Model routing: pick the cheapest tier that can handle a task.
//!
//! Pure functions from (task type, complexity) to a routing tier, and from a
//! tier to the concrete model id, provider id, and health resource the
//! executor must verify before dispatch.

use crate::config::Config;
use crate::pricing;
use crate::store::types::{Complexity, ModelTier, TaskType};

/// Token estimate for budget reservation before task execution
/// (system prompt + context + tool definitions).
pub const EST_TASK_INPUT_TOKENS: u64 = 1500;

/// Recommended tier for a task type and complexity.
pub fn recommend_tier(task_type: TaskType, complexity: Complexity) -> ModelTier {
    use Complexity::*;
    use TaskType::*;
    match (task_type, complexity) {
        (Code, Simple) => ModelTier::Haiku,
        (Code, Medium) | (Code, Complex) => ModelTier::Sonnet,

        (Research, Simple) => ModelTier::Local,
        (Research, Medium) => ModelTier::Haiku,
        (Research, Complex) => ModelTier::Sonnet,

        (Analysis, Simple) => ModelTier::Local,
        (Analysis, Medium) => ModelTier::Haiku,
        (Analysis, Complex) => ModelTier::Sonnet,

        // Asset generation always runs through the free tier; the heavy
        // lifting happens in the image tool.
        (Asset, _) => ModelTier::Local,

        (Integration, Simple) | (Integration, Medium) => ModelTier::Haiku,
        (Integration, Complex) => ModelTier::Sonnet,

        (Documentation, Simple) => ModelTier::Local,
        (Documentation, Medium) => ModelTier::Haiku,
        (Documentation, Complex) => ModelTier::Sonnet,
    }
}

/// Resolve a tier to the configured model id.
pub fn model_id(tier: ModelTier, config: &Config) -> String {
    match tier {
        ModelTier::Haiku => config.models.haiku.clone(),
        ModelTier::Sonnet => config.models.sonnet.clone(),
        ModelTier::Opus => config.models.opus.clone(),
        ModelTier::Local => config.models.local.clone(),
    }
}

/// Provider that serves a tier.
pub fn provider_id(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Local => "ollama",
        _ => "anthropic",
    }
}

/// Health resource a tier requires before dispatch.
pub fn resource_id(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Local => "ollama_local",
        _ => "anthropic_api",
    }
}

/// Default tool set for a task type.
pub fn recommend_tools(task_type: TaskType) -> Vec<String> {
    let names: &[&str] = match task_type {
        TaskType::Code => &["read_file", "write_file", "local_llm"],
        TaskType::Research => &["local_llm"],
        TaskType::Analysis => &["read_file", "local_llm"],
        TaskType::Asset => &["local_llm"],
        TaskType::Integration => &["read_file", "write_file", "local_llm"],
        TaskType::Documentation => &["read_file", "write_file", "local_llm"],
    };
    names.iter().map(|s| s.to_string()).collect()
}

/// Worst-case cost estimate for a task before execution, in nanodollars.
/// Free-tier tasks estimate to zero and skip reservation entirely.
pub fn estimate_task_cost(tier: ModelTier, max_output_tokens: u32, config: &Config) -> u64 {
    if !tier.is_paid() {
        return 0;
    }
    pricing::cost_nanos(
        &model_id(tier, config),
        EST_TASK_INPUT_TOKENS,
        max_output_tokens as u64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_research_runs_free() {
        assert_eq!(
            recommend_tier(TaskType::Research, Complexity::Simple),
            ModelTier::Local
        );
    }

    #[test]
    fn complex_code_gets_sonnet() {
        assert_eq!(
            recommend_tier(TaskType::Code, Complexity::Complex),
            ModelTier::Sonnet
        );
    }

    #[test]
    fn local_tier_estimates_zero() {
        let config = Config::default();
        assert_eq!(estimate_task_cost(ModelTier::Local, 4096, &config), 0);
        assert!(estimate_task_cost(ModelTier::Haiku, 4096, &config) > 0);
    }

    #[test]
    fn tiers_map_to_providers_and_resources() {
        assert_eq!(provider_id(ModelTier::Sonnet), "anthropic");
        assert_eq!(provider_id(ModelTier::Local), "ollama");
        assert_eq!(resource_id(ModelTier::Haiku), "anthropic_api");
        assert_eq!(resource_id(ModelTier::Local), "ollama_local");
    }
}
