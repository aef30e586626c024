//! Intent Classifier
//!
//! Tags a question with one label from the closed [`Intent`] set. Anything
//! else the model says, including a failed call, becomes REPORT.

use crate::llm::{extract_json_object, ModelPort, PromptPurpose};
use crate::query::Intent;
use itertools::Itertools;
use serde::Deserialize;
use tracing::{info, warn};

const CLASSIFY_SYSTEM_PROMPT: &str = r#"You classify questions about manufacturing data.
Labels:
- LOOKUP: details of one specific record (an order, a line, a person)
- AGGREGATION: a single total, average or rate over many records
- COMPARISON: the same measure across lines, shifts, products or people
- TREND: how a measure changes over time
- REPORT: a broad overview combining several measures
Reply with JSON only: {"intent": "<LABEL>"}"#;

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    /// Why the default was used, when it was
    pub fallback_reason: Option<String>,
}

impl Classification {
    pub fn is_default(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct LabelReply {
    intent: String,
}

pub struct IntentClassifier {
    model: ModelPort,
}

impl IntentClassifier {
    pub fn new(model: ModelPort) -> Self {
        Self { model }
    }

    pub async fn classify(&self, question: &str) -> Classification {
        let prompt = format!("QUESTION: {}", question);
        let reply = match self
            .model
            .generate(PromptPurpose::Classify, CLASSIFY_SYSTEM_PROMPT, &prompt)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Classification failed, using {}: {}", Intent::DEFAULT, e);
                return Self::defaulted(format!("classification failed: {}", e));
            }
        };

        match parse_label(&reply) {
            Some(intent) => {
                info!("Classified as {}", intent);
                Classification {
                    intent,
                    fallback_reason: None,
                }
            }
            None => {
                warn!("Classifier answered outside the label set: {}", reply);
                Self::defaulted(format!(
                    "classifier answered '{}', which is not one of {}",
                    reply.chars().take(80).collect::<String>(),
                    Intent::ALL.iter().join(", ")
                ))
            }
        }
    }

    fn defaulted(reason: String) -> Classification {
        Classification {
            intent: Intent::DEFAULT,
            fallback_reason: Some(reason),
        }
    }
}

/// `{"intent": "TREND"}` or a bare label, case-insensitive.
pub fn parse_label(reply: &str) -> Option<Intent> {
    if let Some(json) = extract_json_object(reply) {
        if let Ok(parsed) = serde_json::from_str::<LabelReply>(json) {
            return parsed.intent.trim().parse().ok();
        }
    }
    let bare = reply.trim().trim_matches(|c: char| !c.is_ascii_alphabetic());
    bare.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedModel, ScriptedReply};
    use std::sync::Arc;
    use std::time::Duration;

    fn classifier(reply: ScriptedReply) -> IntentClassifier {
        let model = ScriptedModel::new().reply(PromptPurpose::Classify, reply);
        IntentClassifier::new(ModelPort::new(Arc::new(model), Duration::from_millis(50), 32))
    }

    #[test]
    fn test_parse_label_forms() {
        assert_eq!(parse_label(r#"{"intent": "TREND"}"#), Some(Intent::Trend));
        assert_eq!(parse_label("Sure: {\"intent\":\"comparison\"}"), Some(Intent::Comparison));
        assert_eq!(parse_label("LOOKUP."), Some(Intent::Lookup));
        assert_eq!(parse_label(r#"{"intent": "FORECAST"}"#), None);
        assert_eq!(parse_label("I think it is about yield"), None);
    }

    #[tokio::test]
    async fn test_in_set_label_is_kept() {
        let result = classifier(ScriptedReply::text(r#"{"intent": "AGGREGATION"}"#))
            .classify("total output last week")
            .await;
        assert_eq!(result.intent, Intent::Aggregation);
        assert!(!result.is_default());
    }

    #[tokio::test]
    async fn test_out_of_set_label_defaults_to_report() {
        let result = classifier(ScriptedReply::text(r#"{"intent": "FORECAST"}"#))
            .classify("what will output be")
            .await;
        assert_eq!(result.intent, Intent::Report);
        assert!(result.fallback_reason.unwrap().contains("FORECAST"));
    }

    #[tokio::test]
    async fn test_failed_call_defaults_to_report() {
        let result = classifier(ScriptedReply::Hang).classify("anything").await;
        assert_eq!(result.intent, Intent::Report);
        assert!(result.fallback_reason.unwrap().starts_with("classification failed"));
    }
}
