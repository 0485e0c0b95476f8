//! Retrieval-augmented generation and citation reconciliation.
//!
//! Retrieved passages are numbered 1..k in ascending distance order and
//! embedded into a grounded system prompt; that ordering is the canonical
//! mapping from a `[ref:N]` marker in the generated text back to a passage.
//! Generation is streamed token-by-token through an `mpsc` channel. After
//! the full text is assembled, the markers are reconciled against the
//! passages actually retrieved: distinct N values in ascending order,
//! out-of-range references silently dropped, one display entry per source
//! label (first occurrence wins).
//!
//! The persisted assistant message is always the citation-stripped text —
//! markers are a transport/display concern, never durable history.

use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;

use crate::error::{PipelineError, PipelineResult};
use crate::index::VectorIndex;
use crate::llm::{ChatModel, CompletionRequest, ModelTier};
use crate::models::{CitedSource, Passage};

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[ref:(\d+)\]").expect("citation regex is valid"));

/// Citation markers plus any whitespace immediately before them, so that
/// stripping does not leave doubled spaces mid-sentence.
static CITATION_STRIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\[ref:\d+\]").expect("citation strip regex is valid"));

pub struct RagGenerator {
    model: Arc<dyn ChatModel>,
    index: Arc<VectorIndex>,
    scope: String,
}

impl RagGenerator {
    pub fn new(model: Arc<dyn ChatModel>, index: Arc<VectorIndex>, scope: &str) -> Self {
        Self {
            model,
            index,
            scope: scope.to_string(),
        }
    }

    /// Fetch the k nearest passages for a search query, ascending by
    /// distance. Position in the returned vec (1-based) is the reference
    /// number the model is told to cite.
    pub async fn retrieve(&self, search_query: &str, k: usize) -> PipelineResult<Vec<Passage>> {
        self.index.search(search_query, k).await
    }

    /// Stream a grounded answer, forwarding each text increment into `out`
    /// as the model produces it, and return the accumulated full text.
    ///
    /// A dropped receiver stops forwarding but not accumulation, so the
    /// turn can still be persisted. A mid-stream model failure is returned
    /// as a terminal error; tokens already sent are not retracted and no
    /// retry is attempted.
    pub async fn generate(
        &self,
        question: &str,
        history: &str,
        passages: &[Passage],
        out: mpsc::Sender<String>,
    ) -> PipelineResult<String> {
        let req = CompletionRequest {
            tier: ModelTier::Chat,
            system: Some(build_system_prompt(&self.scope, passages)),
            user: build_user_prompt(history, question),
            max_tokens: None,
        };

        let (tx, mut rx) = mpsc::channel::<String>(32);
        let model = Arc::clone(&self.model);
        let producer = tokio::spawn(async move { model.stream(req, tx).await });

        let mut full_text = String::new();
        let mut consumer_gone = false;
        while let Some(token) = rx.recv().await {
            full_text.push_str(&token);
            if !consumer_gone && out.send(token).await.is_err() {
                consumer_gone = true;
            }
        }

        producer
            .await
            .map_err(|e| PipelineError::Model(format!("generation task failed: {}", e)))??;

        Ok(full_text)
    }
}

/// Format passages as numbered context blocks for the system prompt.
fn format_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[ref:{}] (source: {})\n{}", i + 1, p.source, p.text))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn build_system_prompt(scope: &str, passages: &[Passage]) -> String {
    format!(
        r#"You are an assistant that answers questions about {scope}.

Rules:
- Answer ONLY from the context passages below. Do not invent facts.
- When a sentence uses information from a passage, end that sentence with the passage's citation marker, e.g. [ref:2].
- If the question refers to a person or time period that cannot be resolved from the context or the chat history, ask a short clarifying question instead of guessing.
- If the question is not about {scope}, say so briefly and decline.
- Answer in the user's language.

Context:
{context}"#,
        scope = scope,
        context = format_passages(passages),
    )
}

fn build_user_prompt(history: &str, question: &str) -> String {
    if history.trim().is_empty() {
        format!("Question:\n{}", question)
    } else {
        format!("Chat history:\n{}\n\nQuestion:\n{}", history, question)
    }
}

/// Distinct `[ref:N]` reference numbers present in `text`, ascending.
pub fn extract_citation_numbers(text: &str) -> BTreeSet<usize> {
    CITATION_RE
        .captures_iter(text)
        .filter_map(|cap| cap[1].parse::<usize>().ok())
        .collect()
}

/// Build the display source list for a generated answer.
///
/// Iterates cited reference numbers in ascending order, maps each to its
/// 1-based passage, drops out-of-range references without error, and keeps
/// only the first entry per source label. Distances become display
/// percentages via `100 * exp(-distance * 0.5)` — a presentation heuristic,
/// not a probability.
pub fn resolve_sources(text: &str, passages: &[Passage]) -> Vec<CitedSource> {
    let mut sources = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for n in extract_citation_numbers(text) {
        if n == 0 || n > passages.len() {
            continue;
        }
        let passage = &passages[n - 1];
        if !seen.insert(passage.source.as_str()) {
            continue;
        }
        sources.push(CitedSource {
            number: sources.len() + 1,
            source: passage.source.clone(),
            similarity: similarity_percent(passage.distance),
        });
    }

    sources
}

/// Remove every citation marker (and the whitespace glued to it) from the
/// text. Applied before the assistant message is persisted.
pub fn strip_citation_markers(text: &str) -> String {
    CITATION_STRIP_RE.replace_all(text, "").trim().to_string()
}

/// Map a raw distance to a bounded display percentage in (0, 100].
pub fn similarity_percent(distance: f64) -> f64 {
    let pct = 100.0 * (-distance * 0.5).exp();
    (pct * 10.0).round() / 10.0
}
