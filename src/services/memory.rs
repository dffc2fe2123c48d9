//! Searchable memory of narration produced earlier in the run.
//!
//! Each completed unit is cut into fixed-size slices that are embedded and
//! appended. The rewrite worker queries the store before generating the next
//! unit and feeds the closest slices into its prompt.

use anyhow::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::retry::{call_with_retry, RetryPolicy};
use crate::services::embedding::EmbeddingClient;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "crate::core::config::default_true")]
    pub enabled: bool,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_slice_chars")]
    pub slice_chars: usize,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_model() -> String {
    "text-embedding-004".to_string()
}
fn default_slice_chars() -> usize {
    3000
}
fn default_top_k() -> usize {
    3
}
fn default_snippet_chars() -> usize {
    600
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            slice_chars: default_slice_chars(),
            top_k: default_top_k(),
            snippet_chars: default_snippet_chars(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryDocument {
    pub unit_name: String,
    pub unit_ordinal: usize,
    pub slice_index: usize,
    pub text: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub unit_name: String,
    pub unit_ordinal: usize,
    pub slice_index: usize,
    pub text: String,
    pub score: f32,
}

pub struct ContextMemory {
    client: Box<dyn EmbeddingClient>,
    config: MemoryConfig,
    documents: Vec<MemoryDocument>,
}

impl ContextMemory {
    pub fn new(client: Box<dyn EmbeddingClient>, config: MemoryConfig) -> Self {
        Self {
            client,
            config,
            documents: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains_unit(&self, unit_name: &str) -> bool {
        self.documents.iter().any(|d| d.unit_name == unit_name)
    }

    /// Slices and embeds a unit's narration. Returns the number of slices
    /// added; a unit already in memory is not added twice.
    pub async fn add_unit(
        &mut self,
        unit_name: &str,
        unit_ordinal: usize,
        narration: &str,
    ) -> Result<usize> {
        if self.contains_unit(unit_name) {
            debug!("'{}' already memorized", unit_name);
            return Ok(0);
        }

        let slices = slice_text(narration, self.config.slice_chars);
        if slices.is_empty() {
            return Ok(0);
        }

        let client = self.client.as_ref();
        let inputs = &slices;
        let vectors = call_with_retry(
            &format!("embedding '{}'", unit_name),
            &self.config.retry,
            move || client.embed(inputs),
        )
        .await?;

        let added = slices.len();
        for (slice_index, (text, embedding)) in slices.into_iter().zip(vectors).enumerate() {
            self.documents.push(MemoryDocument {
                unit_name: unit_name.to_string(),
                unit_ordinal,
                slice_index,
                text,
                embedding,
            });
        }

        info!("Memorized '{}' ({} slices)", unit_name, added);
        Ok(added)
    }

    /// Top-k slices most similar to `query`, restricted to units ordered
    /// before `before_ordinal`.
    pub async fn query(&self, query: &str, before_ordinal: usize) -> Result<Vec<MemoryHit>> {
        let candidates: Vec<&MemoryDocument> = self
            .documents
            .iter()
            .filter(|d| d.unit_ordinal < before_ordinal)
            .collect();
        if candidates.is_empty() || self.config.top_k == 0 {
            return Ok(Vec::new());
        }

        let client = self.client.as_ref();
        let input = vec![query.to_string()];
        let input_ref = &input;
        let mut vectors = call_with_retry("embedding memory query", &self.config.retry, move || {
            client.embed(input_ref)
        })
        .await?;
        let query_vector = vectors.pop().unwrap_or_default();

        let mut hits: Vec<MemoryHit> = candidates
            .into_iter()
            .map(|d| MemoryHit {
                unit_name: d.unit_name.clone(),
                unit_ordinal: d.unit_ordinal,
                slice_index: d.slice_index,
                text: d.text.clone(),
                score: cosine_similarity(&query_vector, &d.embedding),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.unit_ordinal.cmp(&b.unit_ordinal))
                .then(a.slice_index.cmp(&b.slice_index))
        });
        hits.truncate(self.config.top_k);
        Ok(hits)
    }

    /// Renders hits as prompt context, one snippet per hit.
    pub fn format_context(&self, hits: &[MemoryHit]) -> String {
        hits.iter()
            .map(|hit| {
                format!(
                    "FROM CHAPTER '{}':\n{}",
                    hit.unit_name,
                    truncate_chars(&hit.text, self.config.snippet_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Cuts text into slices of exactly `slice_chars` characters (the last may
/// be shorter), ignoring sentence boundaries.
pub fn slice_text(text: &str, slice_chars: usize) -> Vec<String> {
    if slice_chars == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(slice_chars)
        .map(|c| c.iter().collect::<String>())
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// First `limit` characters, with `...` appended when anything was cut.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Embeds text by counting a few marker words, so similarity is
    /// predictable in tests.
    #[derive(Debug, Default)]
    pub(crate) struct KeywordEmbedder {
        pub calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    pub(crate) const KEYWORDS: [&str; 4] = ["storm", "castle", "river", "wolf"];

    #[async_trait]
    impl EmbeddingClient for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.to_vec());
            Ok(texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    KEYWORDS
                        .iter()
                        .map(|k| lower.matches(k).count() as f32 + 0.01)
                        .collect()
                })
                .collect())
        }
    }

    fn memory(slice_chars: usize) -> ContextMemory {
        ContextMemory::new(
            Box::new(KeywordEmbedder::default()),
            MemoryConfig {
                slice_chars,
                top_k: 2,
                snippet_chars: 20,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_slices_are_fixed_size() {
        let text = "a".repeat(7001);
        let slices = slice_text(&text, 3000);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].chars().count(), 3000);
        assert_eq!(slices[2].chars().count(), 1001);
    }

    #[test]
    fn test_truncate_adds_ellipsis() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefghij", 4), "abcd...");
    }

    #[tokio::test]
    async fn test_query_returns_closest_earlier_units() -> Result<()> {
        let mut memory = memory(1000);
        memory.add_unit("storms", 0, "The storm broke over the storm-wracked coast.").await?;
        memory.add_unit("keep", 1, "The castle walls held. The castle gate did not.").await?;
        memory.add_unit("ford", 2, "They crossed the river at dawn.").await?;
        assert_eq!(memory.len(), 3);

        let hits = memory.query("a castle under siege", 3).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].unit_name, "keep");

        // Units at or after the current ordinal are never returned.
        let hits = memory.query("a castle under siege", 1).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].unit_name, "storms");
        Ok(())
    }

    #[tokio::test]
    async fn test_add_unit_is_idempotent() -> Result<()> {
        let mut memory = memory(10);
        assert_eq!(memory.add_unit("a", 0, "wolf wolf wolf wolf").await?, 2);
        assert_eq!(memory.add_unit("a", 0, "wolf wolf wolf wolf").await?, 0);
        assert_eq!(memory.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_format_context() -> Result<()> {
        let mut memory = memory(1000);
        memory
            .add_unit("01-wolves", 0, "The wolf pack circled the camp all night long.")
            .await?;
        let hits = memory.query("wolf", 1).await?;
        let context = memory.format_context(&hits);
        assert_eq!(context, "FROM CHAPTER '01-wolves':\nThe wolf pack circle...");
        Ok(())
    }
}
