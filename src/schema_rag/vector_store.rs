//! Lexical Vector Store
//!
//! TF-IDF weighted term vectors with cosine similarity. Documents keep their
//! insertion order so equal scores resolve to declaration order.

use crate::error::{AnalyticsError, Result};
use std::collections::{BTreeMap, HashSet};

/// Dense term-weight vector over the store vocabulary.
pub type Embedding = Vec<f32>;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "had", "has",
    "have", "how", "in", "is", "it", "me", "my", "of", "on", "or", "our", "show", "that", "the", "their",
    "this", "to", "us", "was", "we", "were", "what", "when", "which", "who", "with",
];

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Insertion index of the document
    pub position: usize,
    pub id: String,
    pub score: f32,
}

/// In-memory TF-IDF index; built once, searched many times.
#[derive(Debug, Clone)]
pub struct InMemoryVectorStore {
    documents: Vec<Document>,
    vocabulary: BTreeMap<String, usize>,
    idf: Vec<f32>,
    embeddings: Vec<Embedding>,
}

impl InMemoryVectorStore {
    /// Fit the vocabulary and IDF weights over `documents`.
    pub fn build(documents: Vec<Document>) -> Result<Self> {
        if documents.is_empty() {
            return Err(AnalyticsError::Schema(
                "cannot build a term index over zero documents".to_string(),
            ));
        }

        let tokenized: Vec<Vec<String>> = documents.iter().map(|d| tokenize(&d.text)).collect();

        let mut vocabulary = BTreeMap::new();
        for tokens in &tokenized {
            for token in tokens {
                let next = vocabulary.len();
                vocabulary.entry(token.clone()).or_insert(next);
            }
        }
        if vocabulary.is_empty() {
            return Err(AnalyticsError::Schema(
                "term index has an empty vocabulary".to_string(),
            ));
        }

        // smoothed idf: ln((1 + n) / (1 + df)) + 1
        let n = documents.len() as f32;
        let mut document_frequency = vec![0usize; vocabulary.len()];
        for tokens in &tokenized {
            let unique: HashSet<&String> = tokens.iter().collect();
            for token in unique {
                document_frequency[vocabulary[token]] += 1;
            }
        }
        let idf: Vec<f32> = document_frequency
            .iter()
            .map(|df| ((1.0 + n) / (1.0 + *df as f32)).ln() + 1.0)
            .collect();

        let mut store = Self {
            documents,
            vocabulary,
            idf,
            embeddings: Vec::new(),
        };
        store.embeddings = tokenized.iter().map(|tokens| store.weigh(tokens)).collect();
        Ok(store)
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        self.weigh(&tokenize(text))
    }

    /// Score every document against `query`, best first; ties keep insertion order.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        let query_embedding = self.embed_text(query);
        let mut results: Vec<SearchResult> = self
            .documents
            .iter()
            .zip(&self.embeddings)
            .enumerate()
            .map(|(position, (doc, embedding))| SearchResult {
                position,
                id: doc.id.clone(),
                score: cosine_similarity(&query_embedding, embedding),
            })
            .collect();

        // sort_by is stable
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn weigh(&self, tokens: &[String]) -> Embedding {
        let mut embedding = vec![0.0f32; self.vocabulary.len()];
        for token in tokens {
            if let Some(&idx) = self.vocabulary.get(token) {
                embedding[idx] += self.idf[idx];
            }
        }
        embedding
    }
}

/// Lowercased terms; identifiers contribute themselves and their `_` parts.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw in text
        .to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
    {
        if raw.contains('_') {
            push_term(&mut tokens, raw.trim_matches('_'));
            for part in raw.split('_') {
                push_term(&mut tokens, part);
            }
        } else {
            push_term(&mut tokens, raw);
        }
    }
    tokens
}

fn push_term(tokens: &mut Vec<String>, term: &str) {
    if term.len() < 2 || STOPWORDS.contains(&term) {
        return;
    }
    tokens.push(stem(term));
}

fn stem(term: &str) -> String {
    if term.len() > 4 && term.ends_with("ies") {
        format!("{}y", &term[..term.len() - 3])
    } else if term.len() > 3 && term.ends_with('s') && !term.ends_with("ss") {
        term[..term.len() - 1].to_string()
    } else {
        term.to_string()
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
