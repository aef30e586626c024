//! Language model capability
//!
//! Every model-backed stage goes through one narrow call: a prompt in, text
//! out, under a hard timeout. Backends are swappable behind [`LanguageModel`].

pub mod anthropic;
pub mod ollama;
pub mod scripted;

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use scripted::{ScriptedModel, ScriptedReply};

use crate::error::{AnalyticsError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which pipeline stage issued a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPurpose {
    Classify,
    GenerateSql,
    ChartFallback,
    Summarize,
}

impl fmt::Display for PromptPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PromptPurpose::Classify => "classify",
            PromptPurpose::GenerateSql => "generate_sql",
            PromptPurpose::ChartFallback => "chart_fallback",
            PromptPurpose::Summarize => "summarize",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub purpose: PromptPurpose,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// A text-generation backend (local or remote).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Timeout-enforcing handle shared by every model-backed stage.
#[derive(Clone)]
pub struct ModelPort {
    backend: Arc<dyn LanguageModel>,
    timeout: Duration,
    max_tokens: u32,
}

impl ModelPort {
    pub fn new(backend: Arc<dyn LanguageModel>, timeout: Duration, max_tokens: u32) -> Self {
        Self {
            backend,
            timeout,
            max_tokens,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn generate(&self, purpose: PromptPurpose, system: &str, prompt: &str) -> Result<String> {
        let request = GenerationRequest {
            purpose,
            system: system.to_string(),
            prompt: prompt.to_string(),
            max_tokens: self.max_tokens,
            timeout: self.timeout,
        };

        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.backend.generate(&request)).await {
            Ok(Ok(text)) => {
                debug!(
                    "{} call to {} answered in {}ms",
                    purpose,
                    self.backend.name(),
                    started.elapsed().as_millis()
                );
                Ok(text.trim().to_string())
            }
            Ok(Err(e)) => {
                warn!("{} call to {} failed: {}", purpose, self.backend.name(), e);
                Err(e)
            }
            Err(_) => {
                warn!("{} call to {} timed out", purpose, self.backend.name());
                Err(AnalyticsError::Timeout(format!(
                    "{} call exceeded {}ms",
                    purpose,
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

/// Slice out the outermost `{...}` object from a model reply.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}
