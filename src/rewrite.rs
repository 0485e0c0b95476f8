//! Follow-up query rewriting.
//!
//! Short follow-up queries ("November saja") are useless as search strings
//! on their own. The rewriter folds entities from recent history into the
//! query to produce a self-contained search string. It must never return
//! something less usable than its input: on any failure, or when the model
//! result is degenerate, the original query wins.

use std::sync::Arc;

use crate::config::RewriteConfig;
use crate::error::PipelineResult;
use crate::llm::{ChatModel, CompletionRequest, ModelTier};

const REWRITE_PROMPT: &str = r#"Rewrite this query for search by adding context from history.
Fold in entities (names, time periods) the query refers to.

History: {history}

Query: "{query}"

Rewritten (just the search terms):"#;

pub struct QueryRewriter {
    model: Arc<dyn ChatModel>,
    max_query_words: usize,
    history_window_chars: usize,
}

impl QueryRewriter {
    pub fn new(model: Arc<dyn ChatModel>, config: &RewriteConfig) -> Self {
        Self {
            model,
            max_query_words: config.max_query_words,
            history_window_chars: config.history_window_chars,
        }
    }

    /// Rewrite `query` into a self-contained search string using `history`
    /// (pre-formatted "role: content" lines).
    ///
    /// Skips the model entirely when history is blank or the query is long
    /// enough to be self-contained. `Err` only on call failure; the
    /// orchestrator falls back to the original query.
    pub async fn rewrite(&self, query: &str, history: &str) -> PipelineResult<String> {
        if history.trim().is_empty() {
            return Ok(query.to_string());
        }

        if query.split_whitespace().count() > self.max_query_words {
            return Ok(query.to_string());
        }

        let window = tail_chars(history, self.history_window_chars);
        let raw = self
            .model
            .complete(CompletionRequest {
                tier: ModelTier::Fast,
                system: None,
                user: REWRITE_PROMPT
                    .replace("{history}", window)
                    .replace("{query}", query),
                max_tokens: Some(100),
            })
            .await?;

        match clean_rewrite(&raw) {
            Some(rewritten) => {
                tracing::debug!(original = query, rewritten = %rewritten, "rewrote query");
                Ok(rewritten)
            }
            None => Ok(query.to_string()),
        }
    }
}

/// Trailing window of at most `n` characters, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= n {
        return s;
    }
    let skip = char_count - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Trim, strip surrounding quotes, and reject degenerate results
/// (empty or shorter than 3 characters).
fn clean_rewrite(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .trim()
        .to_string();
    if cleaned.chars().count() < 3 {
        return None;
    }
    Some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_chars_short_input() {
        assert_eq!(tail_chars("abc", 500), "abc");
    }

    #[test]
    fn test_tail_chars_truncates_front() {
        let s = "0123456789";
        assert_eq!(tail_chars(s, 4), "6789");
    }

    #[test]
    fn test_tail_chars_multibyte_boundary() {
        let s = "ééééé";
        assert_eq!(tail_chars(s, 2), "éé");
    }

    #[test]
    fn test_clean_rewrite_strips_quotes() {
        assert_eq!(
            clean_rewrite("\"reimburse Angga November\"").as_deref(),
            Some("reimburse Angga November")
        );
        assert_eq!(
            clean_rewrite("'quoted'").as_deref(),
            Some("quoted")
        );
    }

    #[test]
    fn test_clean_rewrite_rejects_degenerate() {
        assert_eq!(clean_rewrite(""), None);
        assert_eq!(clean_rewrite("  \"\" "), None);
        assert_eq!(clean_rewrite("ab"), None);
    }

    // The skip heuristics are pure input checks, exercised here through a
    // model stub that panics if called.
    struct PanicModel;

    #[async_trait::async_trait]
    impl crate::llm::ChatModel for PanicModel {
        async fn complete(
            &self,
            _req: CompletionRequest,
        ) -> crate::error::PipelineResult<String> {
            panic!("model must not be called on the skip path");
        }

        async fn stream(
            &self,
            _req: CompletionRequest,
            _out: tokio::sync::mpsc::Sender<String>,
        ) -> crate::error::PipelineResult<()> {
            panic!("model must not be called on the skip path");
        }
    }

    fn rewriter() -> QueryRewriter {
        QueryRewriter::new(Arc::new(PanicModel), &RewriteConfig::default())
    }

    #[tokio::test]
    async fn test_empty_history_returns_query_unchanged() {
        let result = rewriter().rewrite("November saja", "").await.unwrap();
        assert_eq!(result, "November saja");

        let result = rewriter().rewrite("November saja", "   \n ").await.unwrap();
        assert_eq!(result, "November saja");
    }

    #[tokio::test]
    async fn test_long_query_skips_rewrite() {
        let query = "reimburse Angga bulan apa saja tahun ini";
        let result = rewriter()
            .rewrite(query, "user: something earlier")
            .await
            .unwrap();
        assert_eq!(result, query);
    }
}
