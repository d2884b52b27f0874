//! Configuration for the orchestration core.
//!
//! Everything can be set via environment variables:
//! - `ANTHROPIC_API_KEY` - API key for the hosted model provider.
//! - `ANTHROPIC_BASE_URL` - Optional. Defaults to `https://api.anthropic.com`.
//! - `OLLAMA_HOST` - Optional. Local inference host. Defaults to `http://localhost:11434`.
//! - `IMAGE_HOST` - Optional. Image generation service; probed only when set.
//! - `DATA_DIR` - Optional. Database + project sandboxes. Defaults to `./data`.
//! - `BUDGET_DAILY_USD` / `BUDGET_MONTHLY_USD` / `BUDGET_PER_PROJECT_USD`
//! - `MAX_CONCURRENT_TASKS`, `TICK_INTERVAL_SECS`, `MAX_TOOL_ROUNDS`, `MAX_TASK_RETRIES`
//!
//! Loading has no side effects beyond reading the environment; components
//! receive the finished `Config` from the composition root.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pricing::nanos_from_usd;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Budget limits, in nanodollars.
#[derive(Debug, Clone)]
pub struct BudgetLimits {
    pub daily_nanos: u64,
    pub monthly_nanos: u64,
    pub per_project_nanos: u64,
    /// Warning threshold as a percentage of either period limit.
    pub warn_at_pct: u8,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_nanos: nanos_from_usd(5.0),
            monthly_nanos: nanos_from_usd(50.0),
            per_project_nanos: nanos_from_usd(10.0),
            warn_at_pct: 80,
        }
    }
}

/// Model ids per routing tier.
#[derive(Debug, Clone)]
pub struct ModelIds {
    pub haiku: String,
    pub sonnet: String,
    pub opus: String,
    pub local: String,
}

impl Default for ModelIds {
    fn default() -> Self {
        Self {
            haiku: "claude-haiku-4-5".to_string(),
            sonnet: "claude-sonnet-4-6".to_string(),
            opus: "claude-opus-4-6".to_string(),
            local: "qwen2.5-coder:14b".to_string(),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the hosted provider. Empty means "not configured"; the
    /// resource monitor reports the provider offline and no paid task runs.
    pub api_key: String,

    /// Base URL of the hosted provider.
    pub api_base_url: String,

    /// Model used for plan generation.
    pub planning_model: String,

    /// Model used for output verification (cheap tier).
    pub verification_model: String,

    /// Model ids resolved per tier.
    pub models: ModelIds,

    /// Local inference host (health-probed; free tier).
    pub ollama_host: String,

    /// Embedding model served by the local host.
    pub ollama_embed_model: String,

    /// Image generation host. Probed only when set.
    pub image_host: Option<String>,

    /// Database file + per-project sandboxes live under here.
    pub data_dir: PathBuf,

    /// Budget limits.
    pub budget: BudgetLimits,

    /// Concurrency gate capacity.
    pub max_concurrent_tasks: usize,

    /// Executor tick interval.
    pub tick_interval: Duration,

    /// Maximum request/response rounds per agent run.
    pub max_tool_rounds: u32,

    /// Default completion budget per task.
    pub default_max_tokens: u32,

    /// Transient-error retries before a checkpoint is raised.
    pub max_task_retries: u32,

    /// Retry backoff base; doubled per attempt with jitter.
    pub retry_backoff_base: Duration,

    /// Retry backoff ceiling.
    pub max_backoff: Duration,

    /// Per-dependency output cap when building task context.
    pub context_forward_max_chars: usize,

    /// Raise a checkpoint instead of failing when retries are exhausted.
    pub checkpoint_on_retry_exhausted: bool,

    /// Run output verification after paid tasks complete.
    pub verification_enabled: bool,

    pub verification_max_tokens: u32,

    /// How long `stop()` waits for in-flight workers before force-dropping.
    pub shutdown_grace: Duration,

    /// Provider request timeout (planning and tool rounds).
    pub api_timeout: Duration,

    /// Local generate timeout.
    pub ollama_generate_timeout: Duration,

    /// Embedding timeout.
    pub ollama_embed_timeout: Duration,

    /// Image generation polling ceiling.
    pub image_timeout: Duration,

    /// Health probe cadence.
    pub resource_check_interval: Duration,

    /// Per-probe timeout.
    pub health_probe_timeout: Duration,

    /// Bounded queue size per event subscriber.
    pub event_queue_capacity: usize,

    /// Per-project subscriber cap.
    pub max_subscribers_per_project: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: "https://api.anthropic.com".to_string(),
            planning_model: "claude-sonnet-4-6".to_string(),
            verification_model: "claude-haiku-4-5".to_string(),
            models: ModelIds::default(),
            ollama_host: "http://localhost:11434".to_string(),
            ollama_embed_model: "nomic-embed-text".to_string(),
            image_host: None,
            data_dir: PathBuf::from("data"),
            budget: BudgetLimits::default(),
            max_concurrent_tasks: 3,
            tick_interval: Duration::from_secs(2),
            max_tool_rounds: 10,
            default_max_tokens: 4096,
            max_task_retries: 3,
            retry_backoff_base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(120),
            context_forward_max_chars: 2000,
            checkpoint_on_retry_exhausted: true,
            verification_enabled: false,
            verification_max_tokens: 1024,
            shutdown_grace: Duration::from_secs(30),
            api_timeout: Duration::from_secs(120),
            ollama_generate_timeout: Duration::from_secs(120),
            ollama_embed_timeout: Duration::from_secs(30),
            image_timeout: Duration::from_secs(300),
            resource_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(2),
            event_queue_capacity: 256,
            max_subscribers_per_project: 10,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.api_key = key;
        }
        if let Ok(url) = std::env::var("ANTHROPIC_BASE_URL") {
            config.api_base_url = url;
        }
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            config.ollama_host = host;
        }
        if let Ok(host) = std::env::var("IMAGE_HOST") {
            config.image_host = Some(host);
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.budget.daily_nanos = nanos_from_usd(env_parse("BUDGET_DAILY_USD", 5.0f64)?.max(0.0));
        config.budget.monthly_nanos =
            nanos_from_usd(env_parse("BUDGET_MONTHLY_USD", 50.0f64)?.max(0.0));
        config.budget.per_project_nanos =
            nanos_from_usd(env_parse("BUDGET_PER_PROJECT_USD", 10.0f64)?.max(0.0));

        config.max_concurrent_tasks = env_parse("MAX_CONCURRENT_TASKS", 3usize)?.max(1);
        config.tick_interval =
            Duration::from_secs_f64(env_parse("TICK_INTERVAL_SECS", 2.0f64)?.max(0.1));
        config.max_tool_rounds = env_parse("MAX_TOOL_ROUNDS", 10u32)?.max(1);
        config.max_task_retries = env_parse("MAX_TASK_RETRIES", 3u32)?;
        config.verification_enabled = env_parse("VERIFICATION_ENABLED", false)?;

        Ok(config)
    }

    /// Database file location.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("orchestration.db")
    }

    /// Base directory for per-project file sandboxes.
    pub fn sandbox_base(&self) -> PathBuf {
        self.data_dir.join("projects")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.budget.daily_nanos, nanos_from_usd(5.0));
        assert!(config.tick_interval >= Duration::from_secs(1));
        assert!(!config.verification_enabled);
    }
}
