use crate::error::{AnalyticsError, Result};
use crate::llm::{GenerationRequest, LanguageModel};
use async_trait::async_trait;

/// Local Ollama server, `POST /api/generate`.
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Cheap reachability probe against `/api/tags`.
    pub async fn is_available(&self) -> bool {
        match self.client.get(format!("{}/api/tags", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": request.prompt,
            "system": request.system,
            "stream": false,
            "options": { "num_predict": request.max_tokens, "temperature": 0.1 }
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    AnalyticsError::Llm(format!(
                        "Cannot connect to Ollama at {}. Is 'ollama serve' running?",
                        self.base_url
                    ))
                } else {
                    AnalyticsError::Llm(format!("Ollama call failed: {}", e))
                }
            })?
            .error_for_status()
            .map_err(|e| AnalyticsError::Llm(format!("Ollama returned an error status: {}", e)))?;

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalyticsError::Llm(format!("Failed to parse Ollama response: {}", e)))?;

        let content = response_json["response"]
            .as_str()
            .ok_or_else(|| AnalyticsError::Llm("No 'response' field in Ollama reply".to_string()))?;

        Ok(content.to_string())
    }
}
