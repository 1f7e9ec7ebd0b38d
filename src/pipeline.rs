//! The request-processing pipeline.
//!
//! Phases run in strict order, AUTH -> PARSE -> VALIDATE -> [RETRIEVE] ->
//! SAFETY -> COMPLETE -> RESPOND, each wrapped in its own child span under
//! the per-request root span. Any phase can short-circuit with a typed
//! outcome; no later phase runs after a failure. END bookkeeping (request
//! counter + latency histogram) happens exactly once per request through a
//! drop guard, so it survives early returns and client disconnects.

use std::sync::Arc;

use serde::Deserialize;

use crate::auth::TokenVerifier;
use crate::completion::{ChatMessage, CompletionClient, CompletionResult};
use crate::correlation::CorrelationId;
use crate::error::GatewayError;
use crate::retrieval::{Document, RetrievalClient};
use crate::safety::SafetyFilter;
use crate::telemetry::{AttrValue, Recorder, RequestTimer, SpanGuard, SpanStatus};

pub const MAX_MESSAGE_LENGTH: usize = 4000;

const ROOT_SPAN: &str = "chat_request";

/// Wire payload for `POST /chat`. Accepts both the single-message shape
/// and the multi-turn `messages` array; both normalize into
/// [`NormalizedRequest`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub enable_rag: Option<bool>,
}

/// The single internal request representation all wire shapes map into.
#[derive(Debug)]
pub struct NormalizedRequest {
    pub message: String,
    pub prior: Vec<ChatMessage>,
    pub enable_rag: bool,
}

impl ChatPayload {
    /// Map either wire shape into the internal representation, applying
    /// the shared validation rules once.
    pub fn normalize(self) -> Result<NormalizedRequest, GatewayError> {
        let enable_rag = self.enable_rag.unwrap_or(false);
        let (message, prior) = match (self.message, self.messages) {
            (Some(message), _) => (message, Vec::new()),
            (None, Some(messages)) => {
                let last_user = messages
                    .iter()
                    .rposition(|m| m.role.eq_ignore_ascii_case("user"))
                    .ok_or_else(|| {
                        GatewayError::Validation(
                            "Missing user message in 'messages' array".to_string(),
                        )
                    })?;
                let mut messages = messages;
                let current = messages.remove(last_user);
                messages.truncate(last_user);
                (current.content, messages)
            }
            (None, None) => {
                return Err(GatewayError::Validation(
                    "Missing or invalid 'message' field in request body".to_string(),
                ))
            }
        };
        if message.trim().is_empty() {
            return Err(GatewayError::Validation(
                "Missing or invalid 'message' field in request body".to_string(),
            ));
        }
        if message.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(GatewayError::Validation(format!(
                "Message exceeds maximum length of {} characters",
                MAX_MESSAGE_LENGTH
            )));
        }
        Ok(NormalizedRequest {
            message,
            prior,
            enable_rag,
        })
    }
}

/// Terminal outcome of one pipeline run.
pub enum ChatOutcome {
    Success(CompletionResult),
    /// The safety filter stopped the request. A policy answer, not a
    /// caller error: surfaced as 200 with a distinct body.
    Blocked { categories: Vec<String> },
    Error(GatewayError),
}

/// Orchestrates one request through all phases. Stateless across
/// requests; all dependencies are injected at construction.
pub struct Pipeline {
    verifier: Arc<TokenVerifier>,
    retrieval: Option<RetrievalClient>,
    safety: Arc<dyn SafetyFilter>,
    completion: Option<CompletionClient>,
    recorder: Recorder,
    rag_enabled: bool,
    top_k: usize,
}

impl Pipeline {
    pub fn new(
        verifier: Arc<TokenVerifier>,
        retrieval: Option<RetrievalClient>,
        safety: Arc<dyn SafetyFilter>,
        completion: Option<CompletionClient>,
        recorder: Recorder,
        rag_enabled: bool,
        top_k: usize,
    ) -> Self {
        Self {
            verifier,
            retrieval,
            safety,
            completion,
            recorder,
            rag_enabled,
            top_k,
        }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Run the full pipeline for one request. `payload` is `Err` when the
    /// body could not be parsed as JSON; the PARSE phase owns that
    /// failure so the span tree stays complete.
    pub async fn handle_chat(
        &self,
        bearer: Option<&str>,
        payload: Result<ChatPayload, String>,
    ) -> (CorrelationId, ChatOutcome) {
        let correlation_id = CorrelationId::generate();
        let _timer = RequestTimer::new(self.recorder.metrics.clone());
        let mut root = SpanGuard::new(
            &self.recorder,
            self.recorder.start_span(ROOT_SPAN, &correlation_id, None),
        );

        let outcome = self.run(&correlation_id, bearer, payload, &mut root).await;

        match &outcome {
            ChatOutcome::Success(result) => {
                root.span().set_attributes([
                    ("request.success", AttrValue::from(true)),
                    ("tokens.total", AttrValue::from(result.usage.total_tokens)),
                ]);
                root.set_status(SpanStatus::Ok);
            }
            ChatOutcome::Blocked { categories } => {
                root.span().set_attributes([
                    ("request.blocked", AttrValue::from(true)),
                    ("request.blocked_reason", AttrValue::from("safety_filter")),
                ]);
                root.span().add_event(
                    "request.blocked",
                    [("blocked_categories", AttrValue::from(categories.join(",")))],
                );
                root.set_status(SpanStatus::Error(
                    "Content blocked by safety filter".to_string(),
                ));
                self.recorder.metrics.inc_error("safety_blocked");
            }
            ChatOutcome::Error(err) => {
                root.span().add_event(
                    "request.error",
                    [("error.kind", AttrValue::from(err.kind()))],
                );
                root.set_status(SpanStatus::Error(err.to_string()));
                self.recorder.metrics.inc_error(err.kind());
                tracing::warn!(
                    correlation_id = %correlation_id,
                    error_kind = err.kind(),
                    "chat request failed"
                );
            }
        }
        (correlation_id, outcome)
    }

    async fn run(
        &self,
        correlation_id: &CorrelationId,
        bearer: Option<&str>,
        payload: Result<ChatPayload, String>,
        root: &mut SpanGuard,
    ) -> ChatOutcome {
        // AUTH
        {
            let mut span = self.phase_span("auth", correlation_id);
            match self.verifier.verify(bearer).await {
                Ok(claims) => {
                    span.span()
                        .set_attributes([("user.id", AttrValue::from(claims.sub.as_str()))]);
                    span.finish(SpanStatus::Ok);
                }
                Err(err) => {
                    span.finish(SpanStatus::Error(err.to_string()));
                    return ChatOutcome::Error(err.into());
                }
            }
        }

        // PARSE
        let payload = {
            let span = self.phase_span("parse", correlation_id);
            match payload {
                Ok(payload) => {
                    span.finish(SpanStatus::Ok);
                    payload
                }
                Err(reason) => {
                    span.finish(SpanStatus::Error(reason.clone()));
                    return ChatOutcome::Error(GatewayError::Validation(reason));
                }
            }
        };

        // VALIDATE
        let request = {
            let mut span = self.phase_span("validate", correlation_id);
            match payload.normalize() {
                Ok(request) => {
                    span.span().set_attributes([
                        ("request.chars", AttrValue::from(request.message.chars().count())),
                        ("request.prior_turns", AttrValue::from(request.prior.len())),
                        ("request.use_rag", AttrValue::from(request.enable_rag)),
                    ]);
                    span.finish(SpanStatus::Ok);
                    request
                }
                Err(err) => {
                    span.finish(SpanStatus::Error(err.to_string()));
                    return ChatOutcome::Error(err);
                }
            }
        };
        root.span()
            .set_attributes([("request.use_rag", AttrValue::from(request.enable_rag))]);

        // RETRIEVE, skipped entirely (no span) when RAG is off globally or
        // per-request. Failures inside degrade to an empty context.
        let documents: Vec<Document> = if self.rag_enabled && request.enable_rag {
            let mut span = self.phase_span("retrieve", correlation_id);
            let documents = match &self.retrieval {
                Some(retrieval) => retrieval.retrieve(&request.message, self.top_k).await,
                None => {
                    tracing::warn!("RAG requested but search backend not configured");
                    Vec::new()
                }
            };
            let top_score = documents.first().map(|d| d.score).unwrap_or(0.0);
            span.span().set_attributes([
                ("rag.top_k", AttrValue::from(self.top_k)),
                ("rag.documents_retrieved", AttrValue::from(documents.len())),
                ("rag.top_score", AttrValue::from(top_score)),
            ]);
            span.finish(SpanStatus::Ok);
            documents
        } else {
            Vec::new()
        };

        // SAFETY
        {
            let mut span = self.phase_span("safety", correlation_id);
            match self.safety.check(&request.message).await {
                Ok(result) if !result.is_safe => {
                    span.span()
                        .set_attributes([("safety.result", AttrValue::from("blocked"))]);
                    span.span().add_event(
                        "safety.check_complete",
                        [(
                            "blocked_categories",
                            AttrValue::from(result.blocked_categories.join(",")),
                        )],
                    );
                    span.finish(SpanStatus::Error(
                        "Content blocked by safety filter".to_string(),
                    ));
                    return ChatOutcome::Blocked {
                        categories: result.blocked_categories,
                    };
                }
                Ok(_) => {
                    span.span()
                        .set_attributes([("safety.result", AttrValue::from("passed"))]);
                    span.finish(SpanStatus::Ok);
                }
                Err(err) => {
                    // Fail closed: an unreachable classifier must not let
                    // unchecked content through to completion.
                    span.finish(SpanStatus::Error(err.to_string()));
                    return ChatOutcome::Error(GatewayError::Unexpected(format!(
                        "safety check failed: {err}"
                    )));
                }
            }
        }

        // COMPLETE
        let result = {
            let mut span = self.phase_span("complete", correlation_id);
            let Some(completion) = &self.completion else {
                let err =
                    GatewayError::Configuration("completion backend not configured".to_string());
                span.finish(SpanStatus::Error(err.to_string()));
                return ChatOutcome::Error(err);
            };
            match completion
                .complete(&request.message, &documents, &request.prior)
                .await
            {
                Ok(result) => {
                    span.span().set_attributes([
                        ("llm.model", AttrValue::from(result.model.as_str())),
                        ("llm.finish_reason", AttrValue::from(result.finish_reason.as_str())),
                        ("tokens.prompt", AttrValue::from(result.usage.prompt_tokens)),
                        (
                            "tokens.completion",
                            AttrValue::from(result.usage.completion_tokens),
                        ),
                        ("tokens.total", AttrValue::from(result.usage.total_tokens)),
                    ]);
                    span.finish(SpanStatus::Ok);
                    result
                }
                Err(err) => {
                    span.finish(SpanStatus::Error(err.to_string()));
                    return ChatOutcome::Error(err.into());
                }
            }
        };

        // RESPOND
        {
            let mut span = self.phase_span("respond", correlation_id);
            span.span()
                .set_attributes([("answer_chars", AttrValue::from(result.answer.chars().count()))]);
            span.finish(SpanStatus::Ok);
        }

        ChatOutcome::Success(result)
    }

    fn phase_span(&self, name: &'static str, correlation_id: &CorrelationId) -> SpanGuard {
        SpanGuard::new(
            &self.recorder,
            self.recorder.start_span(name, correlation_id, Some(ROOT_SPAN)),
        )
    }
}
