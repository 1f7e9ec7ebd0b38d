//! Content safety gate.
//!
//! The filter is a pluggable capability: the built-in implementation is a
//! deterministic keyword classifier driven by configuration, and a
//! production deployment can substitute a real content-classifier call
//! behind the same trait. An unsafe result is terminal for the request;
//! the pipeline never reaches the completion backend.

/// Outcome of a safety classification.
#[derive(Debug, Clone)]
pub struct SafetyResult {
    pub is_safe: bool,
    pub blocked_categories: Vec<String>,
}

impl SafetyResult {
    pub fn safe() -> Self {
        SafetyResult {
            is_safe: true,
            blocked_categories: Vec::new(),
        }
    }

    pub fn blocked(categories: Vec<String>) -> Self {
        SafetyResult {
            is_safe: false,
            blocked_categories: categories,
        }
    }
}

/// Classifies text as safe or blocked. Pure with respect to the pipeline:
/// no side effects beyond the classification itself.
#[async_trait::async_trait]
pub trait SafetyFilter: Send + Sync {
    async fn check(&self, message: &str) -> anyhow::Result<SafetyResult>;
}

/// Deterministic case-insensitive term matcher. An empty term list means
/// everything passes; matched terms block under the `blocklist` category.
pub struct KeywordSafetyFilter {
    terms: Vec<String>,
}

impl KeywordSafetyFilter {
    pub fn new(terms: Vec<String>) -> Self {
        Self {
            terms: terms.into_iter().map(|t| t.to_lowercase()).collect(),
        }
    }
}

#[async_trait::async_trait]
impl SafetyFilter for KeywordSafetyFilter {
    async fn check(&self, message: &str) -> anyhow::Result<SafetyResult> {
        if self.terms.is_empty() {
            return Ok(SafetyResult::safe());
        }
        let haystack = message.to_lowercase();
        let hit = self.terms.iter().any(|term| haystack.contains(term));
        if hit {
            Ok(SafetyResult::blocked(vec!["blocklist".to_string()]))
        } else {
            Ok(SafetyResult::safe())
        }
    }
}
