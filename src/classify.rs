//! Query classification: does this turn need document retrieval?
//!
//! Two layers. A heuristic fast path answers for unambiguous small talk
//! without any model call: exact membership in a fixed greeting/closing set
//! (case-insensitive, punctuation-stripped) or a very short normalized
//! string. Everything else goes to a fast-tier model with a strict one-word
//! output contract; any output outside the two valid labels is coerced to
//! [`Classification::NeedsRetrieval`] — over-retrieving is cheaper than
//! silently skipping a grounded answer.

use std::sync::Arc;

use crate::error::PipelineResult;
use crate::llm::{ChatModel, CompletionRequest, ModelTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NeedsRetrieval,
    Conversational,
}

/// Greetings, closings, and acknowledgments that never need retrieval.
/// English plus Indonesian, matching the corpus the assistant serves.
const CONVERSATIONAL_PHRASES: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "yo",
    "halo",
    "hai",
    "ok",
    "oke",
    "okay",
    "thanks",
    "thank you",
    "terima kasih",
    "makasih",
    "bye",
    "goodbye",
    "see you",
    "sampai jumpa",
    "selamat pagi",
    "selamat siang",
    "selamat sore",
    "selamat malam",
    "pagi",
    "siang",
    "malam",
    "good morning",
    "good afternoon",
    "good evening",
    "good night",
];

/// Canned reply used when the conversational model call itself fails.
pub const FALLBACK_CONVERSATIONAL_REPLY: &str =
    "I'm an assistant for reimbursement data. Ask me anything about it.";

const CLASSIFICATION_PROMPT: &str = r#"Classify this query into one of two categories:

1. "RAG" - Query is about reimbursement data, expenses, claims, or needs document retrieval
   Examples: "reimburse Angga", "data bulan Agustus", "total pengeluaran", "klaim transport"

2. "CHAT" - Query is a greeting, thanks, or general chat NOT about reimbursement
   Examples: "halo", "terima kasih", "ok", "selamat pagi", "bye"

Query: "{query}"

Respond with ONLY one word: either "RAG" or "CHAT""#;

const CONVERSATIONAL_PROMPT: &str = r#"You are a friendly assistant for a reimbursement system.
The user sent a message that is NOT about reimbursement data (a greeting, thanks, etc).

Reply briefly and warmly, in the user's language.
If it fits naturally, mention that you can help with reimbursement data.

User message: "{query}"

Short reply (1-2 sentences):"#;

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize(query: &str) -> String {
    let lowered = query.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Heuristic shortcut: returns `Some(Conversational)` for exact greeting
/// matches and near-empty inputs, `None` when a model call is required.
pub fn fast_path(query: &str) -> Option<Classification> {
    let normalized = normalize(query);
    if normalized.chars().count() <= 3 {
        return Some(Classification::Conversational);
    }
    if CONVERSATIONAL_PHRASES.contains(&normalized.as_str()) {
        return Some(Classification::Conversational);
    }
    None
}

/// Coerce raw model output to a classification. Anything off-contract
/// defaults to retrieval.
fn parse_label(raw: &str) -> Classification {
    match raw.trim().to_uppercase().as_str() {
        "CHAT" => Classification::Conversational,
        "RAG" => Classification::NeedsRetrieval,
        _ => Classification::NeedsRetrieval,
    }
}

pub struct QueryClassifier {
    model: Arc<dyn ChatModel>,
}

impl QueryClassifier {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Model-based binary classification. `Err` only on call failure; the
    /// orchestrator maps that to `NeedsRetrieval`.
    pub async fn classify(&self, query: &str) -> PipelineResult<Classification> {
        let raw = self
            .model
            .complete(CompletionRequest {
                tier: ModelTier::Fast,
                system: None,
                user: CLASSIFICATION_PROMPT.replace("{query}", query),
                max_tokens: Some(50),
            })
            .await?;

        let classification = parse_label(&raw);
        tracing::debug!(query, output = %raw.trim(), ?classification, "classified query");
        Ok(classification)
    }

    /// Short friendly reply for turns that skip retrieval entirely.
    pub async fn conversational_reply(&self, query: &str) -> PipelineResult<String> {
        let raw = self
            .model
            .complete(CompletionRequest {
                tier: ModelTier::Fast,
                system: None,
                user: CONVERSATIONAL_PROMPT.replace("{query}", query),
                max_tokens: Some(200),
            })
            .await?;
        Ok(raw.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("Hello!!!"), "hello");
        assert_eq!(normalize("  Terima   kasih. "), "terima kasih");
        assert_eq!(normalize("OK?"), "ok");
    }

    #[test]
    fn test_fast_path_greetings() {
        assert_eq!(fast_path("Hello"), Some(Classification::Conversational));
        assert_eq!(fast_path("halo!"), Some(Classification::Conversational));
        assert_eq!(
            fast_path("Selamat Pagi"),
            Some(Classification::Conversational)
        );
        assert_eq!(
            fast_path("thank you."),
            Some(Classification::Conversational)
        );
    }

    #[test]
    fn test_fast_path_short_strings() {
        // ≤3 characters after normalization
        assert_eq!(fast_path("ya"), Some(Classification::Conversational));
        assert_eq!(fast_path("???"), Some(Classification::Conversational));
        assert_eq!(fast_path(""), Some(Classification::Conversational));
    }

    #[test]
    fn test_fast_path_defers_real_queries() {
        assert_eq!(fast_path("reimburse Angga bulan apa saja?"), None);
        assert_eq!(fast_path("total klaim transport November"), None);
        // Greeting-prefixed but longer than the set entries
        assert_eq!(fast_path("hello can you show my claims"), None);
    }

    #[test]
    fn test_parse_label_contract() {
        assert_eq!(parse_label("RAG"), Classification::NeedsRetrieval);
        assert_eq!(parse_label(" chat \n"), Classification::Conversational);
        assert_eq!(parse_label("CHAT."), Classification::NeedsRetrieval);
        assert_eq!(
            parse_label("I think this needs retrieval"),
            Classification::NeedsRetrieval
        );
        assert_eq!(parse_label(""), Classification::NeedsRetrieval);
    }
}
