//! Document retrieval for RAG.
//!
//! Retrieval is best-effort by design: any backend failure degrades to an
//! empty result so the pipeline proceeds without context rather than
//! failing the whole request.

use std::time::Duration;

use serde::Deserialize;

/// A retrieved reference document. Content flows into the prompt but is
/// never recorded in telemetry; only id, score and count are loggable.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub category: Option<String>,
}

/// Backend capability: ranked search over an index.
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Document>>;
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "@search.score")]
    score: Option<f64>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<SearchHit>,
}

/// Azure-AI-Search-shaped HTTP backend. Posts a search request to the
/// configured index with a bounded timeout.
pub struct HttpSearchBackend {
    endpoint: String,
    index: String,
    client: reqwest::Client,
}

impl HttpSearchBackend {
    pub fn new(endpoint: String, index: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            index,
            client,
        })
    }
}

#[async_trait::async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Document>> {
        let url = format!(
            "{}/indexes/{}/docs/search?api-version=2023-11-01",
            self.endpoint.trim_end_matches('/'),
            self.index
        );
        let body = serde_json::json!({
            "search": query,
            "top": k,
            "select": "id,content,category",
        });
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("search backend returned status {status}");
        }
        let parsed: SearchResponse = response.json().await?;
        Ok(parsed
            .value
            .into_iter()
            .map(|hit| Document {
                id: hit.id.unwrap_or_else(|| "unknown".to_string()),
                content: hit.content.unwrap_or_default(),
                score: hit.score.unwrap_or(0.0),
                category: hit.category,
            })
            .collect())
    }
}

/// Retrieval facade used by the pipeline. Owns the degradation policy and
/// the ranking guarantee.
pub struct RetrievalClient {
    backend: std::sync::Arc<dyn SearchBackend>,
}

impl RetrievalClient {
    pub fn new(backend: std::sync::Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }

    /// Retrieve up to `k` documents, ranked descending by score. Ties keep
    /// the backend's original order (stable sort). Backend failures are
    /// absorbed into an empty result.
    pub async fn retrieve(&self, query: &str, k: usize) -> Vec<Document> {
        match self.backend.search(query, k).await {
            Ok(mut documents) => {
                documents.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                tracing::info!(count = documents.len(), "retrieval returned documents");
                documents
            }
            Err(err) => {
                tracing::warn!(error = %err, "retrieval failed, continuing without context");
                Vec::new()
            }
        }
    }
}
