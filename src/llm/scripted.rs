//! Scripted backend
//!
//! Replays queued replies per prompt purpose and records every request, so
//! pipelines can be exercised without a live model.

use crate::error::{AnalyticsError, Result};
use crate::llm::{GenerationRequest, LanguageModel, PromptPurpose};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
    /// Never answers; only a caller-side timeout ends the call
    Hang,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ScriptedReply::Fail(message.into())
    }
}

#[derive(Default)]
pub struct ScriptedModel {
    queued: Mutex<HashMap<PromptPurpose, VecDeque<ScriptedReply>>>,
    sticky: Mutex<HashMap<PromptPurpose, ScriptedReply>>,
    calls: Mutex<Vec<GenerationRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply for `purpose`; queued replies are consumed in order.
    pub fn reply(self, purpose: PromptPurpose, reply: ScriptedReply) -> Self {
        lock(&self.queued).entry(purpose).or_default().push_back(reply);
        self
    }

    /// Reply used for `purpose` whenever its queue is empty.
    pub fn always(self, purpose: PromptPurpose, reply: ScriptedReply) -> Self {
        lock(&self.sticky).insert(purpose, reply);
        self
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, purpose: PromptPurpose) -> usize {
        lock(&self.calls).iter().filter(|r| r.purpose == purpose).count()
    }

    pub fn prompts_for(&self, purpose: PromptPurpose) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|r| r.purpose == purpose)
            .map(|r| r.prompt.clone())
            .collect()
    }

    fn next_reply(&self, purpose: PromptPurpose) -> Option<ScriptedReply> {
        let queued = lock(&self.queued).get_mut(&purpose).and_then(|q| q.pop_front());
        queued.or_else(|| lock(&self.sticky).get(&purpose).cloned())
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        lock(&self.calls).push(request.clone());

        match self.next_reply(request.purpose) {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fail(message)) => Err(AnalyticsError::Llm(message)),
            Some(ScriptedReply::Hang) => {
                std::future::pending::<()>().await;
                Err(AnalyticsError::Llm("scripted hang resumed".to_string()))
            }
            None => Err(AnalyticsError::Llm(format!(
                "no scripted reply for {}",
                request.purpose
            ))),
        }
    }
}
