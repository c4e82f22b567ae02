use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// A retrieved knowledge-base document.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content: String,
}

/// Opaque retrieval/embedding collaborator invoked by the retrieval step.
///
/// `embed` returns a deterministic identifier for the text (a real backend
/// would return a vector; a vector's role here is only to key the search).
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn embed(&self, text: &str) -> Result<String>;
    async fn retrieve(&self, query: &str, embedding: &str) -> Result<Vec<Document>>;
}

/// In-memory keyword retriever over a fixed corpus.
///
/// Scores documents by shared lowercase words with the query and returns
/// the best `top_k`. Deterministic, dependency-free, good enough for demos
/// and tests; a vector-store client drops in behind the same trait.
pub struct KeywordRetriever {
    docs: Vec<Document>,
    top_k: usize,
}

impl KeywordRetriever {
    pub fn new(docs: Vec<Document>) -> Self {
        Self { docs, top_k: 3 }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn from_texts(texts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let docs = texts
            .into_iter()
            .enumerate()
            .map(|(i, content)| Document {
                id: format!("doc-{}", i),
                content: content.into(),
            })
            .collect();
        Self::new(docs)
    }

    fn score(query_words: &[String], content: &str) -> usize {
        let content_lower = content.to_lowercase();
        query_words
            .iter()
            .filter(|w| content_lower.contains(w.as_str()))
            .count()
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn embed(&self, text: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    async fn retrieve(&self, query: &str, _embedding: &str) -> Result<Vec<Document>> {
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(|w| w.to_string())
            .collect();

        let mut scored: Vec<(usize, &Document)> = self
            .docs
            .iter()
            .map(|d| (Self::score(&query_words, &d.content), d))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

        Ok(scored
            .into_iter()
            .take(self.top_k)
            .map(|(_, d)| d.clone())
            .collect())
    }
}
