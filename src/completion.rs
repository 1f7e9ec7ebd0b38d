//! Completion client: prompt assembly and the call to the completion
//! backend.
//!
//! The client builds the augmented message list (system prompt, optional
//! retrieved context block, prior turns, current user message), invokes
//! the backend with fixed sampling parameters from configuration, and
//! records token usage as metric increments. Message text itself never
//! reaches logs or telemetry.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retrieval::Document;
use crate::telemetry::Metrics;

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// One turn in a conversation, wire-compatible with the chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: String) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content,
        }
    }

    pub fn user(content: String) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content,
        }
    }
}

/// Fixed sampling parameters, sourced from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub answer: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion backend unreachable")]
    Transport(#[source] reqwest::Error),
    #[error("completion backend returned status {0}")]
    BadStatus(u16),
    #[error("completion backend returned a malformed response")]
    MalformedResponse,
}

/// Backend capability: turn a message list into generated text plus usage.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: SamplingParams,
    ) -> Result<CompletionResult, CompletionError>;
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

/// Azure-OpenAI-shaped chat/completions backend with a bounded timeout.
pub struct HttpCompletionBackend {
    endpoint: String,
    deployment: String,
    client: reqwest::Client,
}

impl HttpCompletionBackend {
    pub fn new(endpoint: String, deployment: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            deployment,
            client,
        })
    }
}

#[async_trait::async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: SamplingParams,
    ) -> Result<CompletionResult, CompletionError> {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version=2024-02-15-preview",
            self.endpoint.trim_end_matches('/'),
            self.deployment
        );
        let body = serde_json::json!({
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(CompletionError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CompletionError::BadStatus(status.as_u16()));
        }
        let parsed: WireCompletion = response
            .json()
            .await
            .map_err(|_| CompletionError::MalformedResponse)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(CompletionError::MalformedResponse)?;
        let answer = choice.message.content.ok_or(CompletionError::MalformedResponse)?;
        let usage = parsed.usage.unwrap_or_default();
        Ok(CompletionResult {
            answer,
            model: parsed.model.unwrap_or_else(|| self.deployment.clone()),
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }
}

/// Builds the augmented message list and invokes the backend.
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    params: SamplingParams,
    metrics: Arc<Metrics>,
}

impl CompletionClient {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        params: SamplingParams,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            params,
            metrics,
        }
    }

    /// Complete the user message, optionally augmented with retrieved
    /// documents (in their supplied ranking order) and prior turns.
    pub async fn complete(
        &self,
        user_message: &str,
        rag_documents: &[Document],
        prior_messages: &[ChatMessage],
    ) -> Result<CompletionResult, CompletionError> {
        let messages = build_messages(user_message, rag_documents, prior_messages);
        let result = self.backend.complete(&messages, self.params).await?;
        self.metrics.add_tokens(
            result.usage.prompt_tokens,
            result.usage.completion_tokens,
            result.usage.total_tokens,
        );
        tracing::info!(
            model = %result.model,
            finish_reason = %result.finish_reason,
            prompt_tokens = result.usage.prompt_tokens,
            completion_tokens = result.usage.completion_tokens,
            "completion succeeded"
        );
        Ok(result)
    }
}

/// Assemble system + prior + user messages. When documents are present the
/// system prompt gains a context block with one numbered heading per
/// document, preserving the supplied order (retrieval's ranking is not
/// re-sorted here).
pub fn build_messages(
    user_message: &str,
    rag_documents: &[Document],
    prior_messages: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut system = SYSTEM_PROMPT.to_string();
    if !rag_documents.is_empty() {
        system.push_str("\n\nUse the following context to answer the user's question:\n\n");
        let blocks: Vec<String> = rag_documents
            .iter()
            .enumerate()
            .map(|(i, doc)| match &doc.category {
                Some(category) => {
                    format!("[Document {}] ({})\n{}", i + 1, category, doc.content)
                }
                None => format!("[Document {}]\n{}", i + 1, doc.content),
            })
            .collect();
        system.push_str(&blocks.join("\n\n"));
    }

    let mut messages = Vec::with_capacity(prior_messages.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(prior_messages.iter().cloned());
    messages.push(ChatMessage::user(user_message.to_string()));
    messages
}
