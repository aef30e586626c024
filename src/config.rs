//! Configuration
//!
//! Process settings come from the environment (optionally a `.env` file).
//! Retry budgets are constants in [`crate::workflow`] and are not read here.

use crate::error::{AnalyticsError, Result};
use crate::execution::sqlite::{DEFAULT_MAX_ROWS, DEFAULT_QUERY_TIMEOUT};
use crate::llm::{AnthropicClient, LanguageModel, ModelPort, OllamaClient};
use crate::sql::DEFAULT_MAX_STATEMENT_CHARS;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";
pub const DEFAULT_DB_PATH: &str = "data/sample_manufacturing.db";

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    Ollama { base_url: String, model: String },
    Anthropic { api_key: String, model: String },
}

impl ProviderConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderConfig::Ollama { .. } => "ollama",
            ProviderConfig::Anthropic { .. } => "anthropic",
        }
    }

    pub fn build(&self) -> Arc<dyn LanguageModel> {
        match self {
            ProviderConfig::Ollama { base_url, model } => Arc::new(OllamaClient::new(base_url.clone(), model.clone())),
            ProviderConfig::Anthropic { api_key, model } => {
                Arc::new(AnthropicClient::new(api_key.clone(), model.clone()))
            }
        }
    }
}

/// Knobs handed to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Ranked tables written into the SQL prompt
    pub schema_top_k: usize,
    pub max_statement_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            schema_top_k: 4,
            max_statement_chars: DEFAULT_MAX_STATEMENT_CHARS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalystConfig {
    pub provider: ProviderConfig,
    pub db_path: PathBuf,
    pub catalog_overlay: Option<PathBuf>,
    pub llm_timeout: Duration,
    pub llm_max_tokens: u32,
    pub query_timeout: Duration,
    pub max_result_rows: usize,
    pub pipeline: PipelineSettings,
}

impl AnalystConfig {
    /// Read `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider_name = get("LLM_PROVIDER").unwrap_or_else(|| "ollama".to_string());
        let provider = provider_from(&provider_name, &get)?;

        let defaults = PipelineSettings::default();
        Ok(Self {
            provider,
            db_path: get("ANALYST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            catalog_overlay: get("ANALYST_CATALOG_OVERLAY").map(PathBuf::from),
            llm_timeout: Duration::from_secs(parse_number(&get, "LLM_TIMEOUT_SECS", 60)?),
            llm_max_tokens: parse_number(&get, "LLM_MAX_TOKENS", 1024)?,
            query_timeout: Duration::from_secs(parse_number(
                &get,
                "QUERY_TIMEOUT_SECS",
                DEFAULT_QUERY_TIMEOUT.as_secs(),
            )?),
            max_result_rows: parse_number(&get, "MAX_RESULT_ROWS", DEFAULT_MAX_ROWS)?,
            pipeline: PipelineSettings {
                schema_top_k: parse_number(&get, "SCHEMA_TOP_K", defaults.schema_top_k)?,
                max_statement_chars: parse_number(&get, "MAX_STATEMENT_CHARS", defaults.max_statement_chars)?,
            },
        })
    }

    /// Switch provider by name, keeping the rest of the environment.
    pub fn with_provider(mut self, name: &str) -> Result<Self> {
        self.provider = provider_from(name, &|key: &str| {
            std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        })?;
        Ok(self)
    }

    pub fn model_port(&self) -> ModelPort {
        ModelPort::new(self.provider.build(), self.llm_timeout, self.llm_max_tokens)
    }
}

fn provider_from(name: &str, get: &dyn Fn(&str) -> Option<String>) -> Result<ProviderConfig> {
    match name.to_ascii_lowercase().as_str() {
        "ollama" => Ok(ProviderConfig::Ollama {
            base_url: get("OLLAMA_BASE_URL").unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            model: get("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
        }),
        "anthropic" => {
            let api_key = get("ANTHROPIC_API_KEY")
                .ok_or_else(|| AnalyticsError::Config("ANTHROPIC_API_KEY is required for the anthropic provider".to_string()))?;
            Ok(ProviderConfig::Anthropic {
                api_key,
                model: get("ANTHROPIC_MODEL").unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            })
        }
        other => Err(AnalyticsError::Config(format!(
            "unknown LLM_PROVIDER '{}', expected ollama or anthropic",
            other
        ))),
    }
}

fn parse_number<T: FromStr>(get: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| AnalyticsError::Config(format!("{} must be a non-negative number, got '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AnalystConfig> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AnalystConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.provider.name(), "ollama");
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(cfg.llm_timeout, Duration::from_secs(60));
        assert_eq!(cfg.query_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_result_rows, 5000);
        assert_eq!(cfg.pipeline, PipelineSettings::default());
    }

    #[test]
    fn test_overrides_and_anthropic() {
        let cfg = config(&[
            ("LLM_PROVIDER", "Anthropic"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("SCHEMA_TOP_K", "2"),
            ("QUERY_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(
            cfg.provider,
            ProviderConfig::Anthropic {
                api_key: "sk-test".to_string(),
                model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            }
        );
        assert_eq!(cfg.pipeline.schema_top_k, 2);
        assert_eq!(cfg.query_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        assert!(matches!(config(&[("LLM_TIMEOUT_SECS", "soon")]), Err(AnalyticsError::Config(_))));
        assert!(matches!(config(&[("LLM_PROVIDER", "anthropic")]), Err(AnalyticsError::Config(_))));
        assert!(matches!(config(&[("LLM_PROVIDER", "gpt")]), Err(AnalyticsError::Config(_))));
    }
}
