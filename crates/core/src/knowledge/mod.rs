//! Small retrieval-augmented knowledge base over a CSV of financial terms.
//!
//! Rows are rendered as `header: value` documents, split into overlapping chunks,
//! embedded once at load time, and searched by brute-force cosine similarity.

pub mod splitter;

use crate::llm::{ChatMessage, ChatModel, Embedder};
use anyhow::Context;
use splitter::RecursiveSplitter;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_TOP_K: usize = 3;
const EMBED_BATCH_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub text: String,
    pub score: f32,
}

struct IndexedChunk {
    text: String,
    vector: Vec<f32>,
}

pub struct KnowledgeBase {
    chunks: Vec<IndexedChunk>,
    embedder: Arc<dyn Embedder>,
}

impl KnowledgeBase {
    pub async fn from_csv(path: &Path, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read knowledge base {}", path.display()))?;
        let documents = csv_documents(&text)
            .with_context(|| format!("failed to parse knowledge base {}", path.display()))?;
        Self::from_documents(documents, embedder).await
    }

    pub async fn from_documents(
        documents: Vec<String>,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<Self> {
        let splitter = RecursiveSplitter::default();
        let texts: Vec<String> = documents.iter().flat_map(|d| splitter.split(d)).collect();
        anyhow::ensure!(!texts.is_empty(), "knowledge base has no content");

        let mut chunks = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let vectors = embedder
                .embed(batch)
                .await
                .context("failed to embed knowledge base chunks")?;
            anyhow::ensure!(
                vectors.len() == batch.len(),
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            );
            chunks.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(text, vector)| IndexedChunk { text, vector }),
            );
        }

        tracing::info!(
            documents = documents.len(),
            chunks = chunks.len(),
            "knowledge base indexed"
        );
        Ok(Self { chunks, embedder })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Top `k` chunks by cosine similarity, best first.
    pub async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .context("failed to embed query")?
            .into_iter()
            .next()
            .context("embedder returned no vector for the query")?;

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .map(|c| ScoredChunk {
                text: c.text.clone(),
                score: cosine(&query_vec, &c.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    /// Retrieves context for `query` and asks `model` for one grounded answer.
    pub async fn answer(&self, query: &str, model: &dyn ChatModel) -> anyhow::Result<String> {
        let hits = self.search(query, DEFAULT_TOP_K).await?;
        let context = hits
            .iter()
            .map(|h| h.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = answer_prompt(&context, query);
        model.complete(&[ChatMessage::user(prompt)]).await
    }
}

fn answer_prompt(context: &str, question: &str) -> String {
    format!(
        "Please answer the question based on the following context. Your answer must be based on the context information. \
If the question is not related to the context, please answer 'Sorry, I don't know'.\n\
Context: {context}\n\
Question: {question}\n\
Answer (please be concise and clear):"
    )
}

/// One document per data row, each field on its own `header: value` line.
fn csv_documents(text: &str) -> anyhow::Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers().context("missing CSV header")?.clone();

    let mut documents = Vec::new();
    for record in reader.records() {
        let record = record.context("malformed CSV row")?;
        let doc = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| format!("{}: {}", h.trim(), v.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        if !doc.trim().is_empty() {
            documents.push(doc);
        }
    }
    Ok(documents)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{KeywordEmbedder, ScriptedModel};
    use std::io::Write;

    const CSV: &str = "term,definition\n\
P/E ratio,\"Price divided by earnings per share, a valuation ratio\"\n\
Bond,A debt security that pays a coupon\n\
Dividend,A cash payment to shareholders\n";

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(KeywordEmbedder::new(&["ratio", "bond", "dividend", "coupon"]))
    }

    #[test]
    fn renders_rows_as_field_lines() {
        let docs = csv_documents(CSV).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(
            docs[0],
            "term: P/E ratio\ndefinition: Price divided by earnings per share, a valuation ratio"
        );
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CSV.as_bytes()).unwrap();

        let kb = KnowledgeBase::from_csv(file.path(), embedder()).await.unwrap();
        assert_eq!(kb.len(), 3);

        let hits = kb.search("what is a bond coupon?", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.starts_with("term: Bond"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn answer_sends_retrieved_context() {
        let kb = KnowledgeBase::from_documents(csv_documents(CSV).unwrap(), embedder())
            .await
            .unwrap();
        let model = ScriptedModel::new(["A dividend is a cash payment."]);

        let answer = kb.answer("explain dividend", &model).await.unwrap();
        assert_eq!(answer, "A dividend is a cash payment.");

        let calls = model.calls();
        assert_eq!(calls.len(), 1);
        let prompt = &calls[0][0].content;
        assert!(prompt.contains("Context: term: Dividend"));
        assert!(prompt.contains("Question: explain dividend"));
        assert!(prompt.contains("Sorry, I don't know"));
    }

    #[tokio::test]
    async fn empty_knowledge_base_is_rejected() {
        let err = KnowledgeBase::from_documents(Vec::new(), embedder())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("no content"));
    }
}
