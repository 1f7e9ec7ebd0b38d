#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener as TokioTcpListener;

use promptgate::auth::TokenVerifier;
use promptgate::completion::{
    ChatMessage, CompletionBackend, CompletionClient, CompletionError, CompletionResult,
    SamplingParams, TokenUsage,
};
use promptgate::config::RotationConfig;
use promptgate::pipeline::Pipeline;
use promptgate::retrieval::{Document, RetrievalClient, SearchBackend};
use promptgate::safety::KeywordSafetyFilter;
use promptgate::telemetry::{Metrics, Recorder};
use promptgate::{app, AppState};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Completion stub that records every message list it was handed.
pub struct StubCompletion {
    pub calls: AtomicUsize,
    pub captured: Mutex<Vec<Vec<ChatMessage>>>,
    answer: String,
}

impl StubCompletion {
    pub fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
            answer: answer.to_string(),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message list from the most recent call.
    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.captured
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CompletionBackend for StubCompletion {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _params: SamplingParams,
    ) -> Result<CompletionResult, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.captured.lock().unwrap().push(messages.to_vec());
        Ok(CompletionResult {
            answer: self.answer.clone(),
            model: "stub-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: "stop".to_string(),
        })
    }
}

/// Search stub returning a fixed document list, counting calls.
pub struct StaticSearch {
    docs: Vec<Document>,
    pub calls: AtomicUsize,
}

impl StaticSearch {
    pub fn new(docs: Vec<Document>) -> Arc<Self> {
        Arc::new(Self {
            docs,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SearchBackend for StaticSearch {
    async fn search(&self, _query: &str, k: usize) -> anyhow::Result<Vec<Document>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.docs.iter().take(k).cloned().collect())
    }
}

/// Search stub that always fails.
pub struct FailingSearch;

#[async_trait::async_trait]
impl SearchBackend for FailingSearch {
    async fn search(&self, _query: &str, _k: usize) -> anyhow::Result<Vec<Document>> {
        anyhow::bail!("search index unavailable")
    }
}

pub fn doc(id: &str, content: &str, score: f64) -> Document {
    Document {
        id: id.to_string(),
        content: content.to_string(),
        score,
        category: None,
    }
}

fn disabled_verifier() -> Arc<TokenVerifier> {
    Arc::new(
        TokenVerifier::new(
            false,
            None,
            None,
            Duration::from_millis(500),
            Duration::from_secs(300),
        )
        .unwrap(),
    )
}

/// Assembles a pipeline with stub backends and serves it on an ephemeral
/// port. Defaults: auth disabled, completion stub answering "ok", no
/// search backend, RAG off, empty blocklist, no span export.
pub struct TestAppBuilder {
    verifier: Arc<TokenVerifier>,
    completion: Option<Arc<StubCompletion>>,
    search: Option<Arc<dyn SearchBackend>>,
    rag_enabled: bool,
    top_k: usize,
    blocklist: Vec<String>,
    export_file: Option<String>,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        Self {
            verifier: disabled_verifier(),
            completion: Some(StubCompletion::new("ok")),
            search: None,
            rag_enabled: false,
            top_k: 3,
            blocklist: Vec::new(),
            export_file: None,
        }
    }

    pub fn verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = Arc::new(verifier);
        self
    }

    pub fn completion(mut self, completion: Arc<StubCompletion>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn without_completion(mut self) -> Self {
        self.completion = None;
        self
    }

    pub fn rag(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.search = Some(backend);
        self.rag_enabled = true;
        self
    }

    pub fn rag_without_backend(mut self) -> Self {
        self.rag_enabled = true;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn blocklist(mut self, terms: &[&str]) -> Self {
        self.blocklist = terms.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn export_file(mut self, path: &str) -> Self {
        self.export_file = Some(path.to_string());
        self
    }

    pub async fn spawn(self) -> TestApp {
        let metrics = Arc::new(Metrics::new());
        let rotation = RotationConfig {
            max_bytes: None,
            keep: 1,
            compress: false,
        };
        let recorder = match &self.export_file {
            Some(path) => Recorder::new(Some(path), &rotation, metrics.clone()),
            None => Recorder::noop(metrics.clone()),
        };
        let completion = self.completion.clone().map(|backend| {
            CompletionClient::new(
                backend,
                SamplingParams {
                    temperature: 0.7,
                    max_tokens: 800,
                },
                metrics.clone(),
            )
        });
        let retrieval = self.search.map(RetrievalClient::new);
        let safety = Arc::new(KeywordSafetyFilter::new(self.blocklist));
        let pipeline = Pipeline::new(
            self.verifier,
            retrieval,
            safety,
            completion,
            recorder,
            self.rag_enabled,
            self.top_k,
        );

        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(AppState::new(pipeline), None);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestApp {
            addr: format!("http://{}", addr),
            completion: self.completion,
        }
    }
}

pub struct TestApp {
    pub addr: String,
    pub completion: Option<Arc<StubCompletion>>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}
