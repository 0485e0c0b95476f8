//! Chat turn orchestration.
//!
//! A turn runs in two phases. `prepare` does everything that can reject the
//! request: query validation, session resolution, the ownership check, and
//! persisting the user message. `execute` is the streaming state machine
//! that runs after the response has started: cache probe, greeting fast
//! path, rewrite, classification, retrieval, generation, and persistence.
//!
//! This is the single place where collaborator failures are mapped to their
//! safe defaults. The rewriter falls back to the original query, the
//! classifier to retrieval, the cache to a miss, and retrieval to an empty
//! passage list. Only a generation failure is terminal for the turn.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::SemanticCache;
use crate::classify::{
    fast_path, Classification, QueryClassifier, FALLBACK_CONVERSATIONAL_REPLY,
};
use crate::generate::{resolve_sources, strip_citation_markers, RagGenerator};
use crate::models::{MessageRole, StreamEvent};
use crate::rewrite::QueryRewriter;
use crate::store;

const SESSION_TITLE_CHARS: usize = 30;

#[derive(Debug, serde::Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A validated turn, ready to stream. The user message is already persisted.
#[derive(Debug)]
pub struct PreparedTurn {
    pub session_id: String,
    pub user_id: String,
    pub query: String,
    /// Prior session history as "role: content" lines, excluding the
    /// message of this turn.
    pub history: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("session not found")]
    SessionNotFound,
    #[error("session belongs to another user")]
    Forbidden,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct ChatPipeline {
    pool: sqlx::SqlitePool,
    cache: Arc<SemanticCache>,
    cache_enabled: bool,
    classifier: QueryClassifier,
    rewriter: QueryRewriter,
    generator: RagGenerator,
    k: usize,
}

impl ChatPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: sqlx::SqlitePool,
        cache: Arc<SemanticCache>,
        cache_enabled: bool,
        classifier: QueryClassifier,
        rewriter: QueryRewriter,
        generator: RagGenerator,
        k: usize,
    ) -> Self {
        Self {
            pool,
            cache,
            cache_enabled,
            classifier,
            rewriter,
            generator,
            k,
        }
    }

    /// Validate the request, resolve or create the session, and persist the
    /// user message. The ownership check happens here, before any model or
    /// index work and before the first stream byte.
    pub async fn prepare(
        &self,
        user_id: &str,
        request: ChatRequest,
    ) -> Result<PreparedTurn, PrepareError> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(PrepareError::EmptyQuery);
        }

        let session_id = match request.session_id {
            Some(id) => {
                let owner = store::session_owner(&self.pool, &id)
                    .await?
                    .ok_or(PrepareError::SessionNotFound)?;
                if owner != user_id {
                    return Err(PrepareError::Forbidden);
                }
                id
            }
            None => {
                let session =
                    store::create_session(&self.pool, user_id, &session_title(&query)).await?;
                session.id
            }
        };

        let messages = store::session_history(&self.pool, &session_id)
            .await
            .map_err(PrepareError::Internal)?;
        let history = store::format_history(&messages);

        store::append_message(&self.pool, &session_id, user_id, MessageRole::User, &query)
            .await?;

        Ok(PreparedTurn {
            session_id,
            user_id: user_id.to_string(),
            query,
            history,
        })
    }

    /// Run the streaming state machine for a prepared turn.
    ///
    /// Emits the `session_id` event first, then tokens and the optional
    /// `sources` event, and ends with `done` on success. A terminal failure
    /// is returned as `Err`; the caller turns it into the `error` event.
    /// Send failures on `out` mean the client went away and are ignored —
    /// persistence still completes.
    pub async fn execute(
        &self,
        turn: PreparedTurn,
        out: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        let _ = out
            .send(StreamEvent::SessionId {
                session_id: turn.session_id.clone(),
            })
            .await;

        // Cache probe: any error is a miss.
        if self.cache_enabled {
            match self.cache.lookup(&turn.query).await {
                Ok(Some(hit)) => {
                    stream_words(&hit.answer, &out).await;
                    self.persist_assistant(&turn, &hit.answer).await?;
                    let _ = out.send(StreamEvent::Done { cached: true }).await;
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cache lookup failed, treating as miss"),
            }
        }

        // Greeting fast path: no rewrite, no classification model call, and
        // the reply is never cached.
        if fast_path(&turn.query) == Some(Classification::Conversational) {
            let reply = self.conversational_reply(&turn.query).await;
            stream_words(&reply, &out).await;
            self.persist_assistant(&turn, &reply).await?;
            let _ = out.send(StreamEvent::Done { cached: false }).await;
            return Ok(());
        }

        let search_query = match self.rewriter.rewrite(&turn.query, &turn.history).await {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!(error = %e, "rewrite failed, using original query");
                turn.query.clone()
            }
        };

        let classification = match self.classifier.classify(&search_query).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "classification failed, defaulting to retrieval");
                Classification::NeedsRetrieval
            }
        };

        if classification == Classification::Conversational {
            let reply = self.conversational_reply(&turn.query).await;
            stream_words(&reply, &out).await;
            self.persist_assistant(&turn, &reply).await?;
            self.cache_reply(&turn.query, &reply).await;
            let _ = out.send(StreamEvent::Done { cached: false }).await;
            return Ok(());
        }

        // Retrieval failure degrades to an ungrounded prompt rather than
        // failing the turn.
        let passages = match self.generator.retrieve(&search_query, self.k).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!(error = %e, "retrieval failed, generating without context");
                Vec::new()
            }
        };

        let (token_tx, mut token_rx) = mpsc::channel::<String>(32);
        let token_out = out.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(content) = token_rx.recv().await {
                let _ = token_out.send(StreamEvent::Token { content }).await;
            }
        });

        let generated = self
            .generator
            .generate(&turn.query, &turn.history, &passages, token_tx)
            .await;
        let _ = forwarder.await;
        let full_text = generated?;

        let sources = resolve_sources(&full_text, &passages);
        if !sources.is_empty() {
            let _ = out
                .send(StreamEvent::Sources {
                    sources: sources.into_iter().map(Into::into).collect(),
                })
                .await;
        }

        let stripped = strip_citation_markers(&full_text);
        self.persist_assistant(&turn, &stripped).await?;

        self.cache_reply(&turn.query, &stripped).await;

        let _ = out.send(StreamEvent::Done { cached: false }).await;
        Ok(())
    }

    /// Best-effort cache store for a completed reply. Both the grounded and
    /// plain-chat paths pass through here; only the greeting fast path
    /// skips caching.
    async fn cache_reply(&self, query: &str, answer: &str) {
        if !self.cache_enabled {
            return;
        }
        if let Err(e) = self.cache.store(query, answer).await {
            warn!(error = %e, "cache store failed");
        }
    }

    async fn conversational_reply(&self, query: &str) -> String {
        match self.classifier.conversational_reply(query).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "conversational reply failed, using canned fallback");
                FALLBACK_CONVERSATIONAL_REPLY.to_string()
            }
        }
    }

    async fn persist_assistant(&self, turn: &PreparedTurn, content: &str) -> anyhow::Result<()> {
        store::append_message(
            &self.pool,
            &turn.session_id,
            &turn.user_id,
            MessageRole::Assistant,
            content,
        )
        .await
    }
}

/// Leading characters of the first query become the session title.
fn session_title(query: &str) -> String {
    query.chars().take(SESSION_TITLE_CHARS).collect()
}

/// Replay a stored answer as token events, split on whitespace boundaries
/// so the client renders it the same way as a live stream.
async fn stream_words(answer: &str, out: &mpsc::Sender<StreamEvent>) {
    for chunk in answer.split_inclusive(char::is_whitespace) {
        if out
            .send(StreamEvent::Token {
                content: chunk.to_string(),
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_title_truncation() {
        assert_eq!(session_title("short"), "short");
        let long = "a".repeat(100);
        assert_eq!(session_title(&long).chars().count(), SESSION_TITLE_CHARS);
    }

    #[test]
    fn test_session_title_multibyte_safe() {
        let query = "é".repeat(40);
        let title = session_title(&query);
        assert_eq!(title.chars().count(), 30);
        assert!(query.starts_with(&title));
    }

    #[tokio::test]
    async fn test_stream_words_preserves_text() {
        let (tx, mut rx) = mpsc::channel(64);
        stream_words("hello  world\nagain", &tx).await;
        drop(tx);

        let mut rebuilt = String::new();
        while let Some(ev) = rx.recv().await {
            if let StreamEvent::Token { content } = ev {
                rebuilt.push_str(&content);
            }
        }
        assert_eq!(rebuilt, "hello  world\nagain");
    }
}
