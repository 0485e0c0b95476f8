//! Chat model abstraction and the OpenAI-compatible implementation.
//!
//! [`ChatModel`] is the seam between the pipeline and the generation
//! backend. Two call shapes exist:
//!
//! - [`complete`](ChatModel::complete) — short, non-streamed completions used
//!   by the classifier and rewriter, with retry/backoff for transient errors.
//! - [`stream`](ChatModel::stream) — token-by-token generation pushed into an
//!   `mpsc` channel as the model produces output. No retry: a failed
//!   generation is surfaced to the caller, which may re-issue a fresh request.
//!
//! Requests are routed to one of two configured models by [`ModelTier`]:
//! the full chat model for grounded answers, a cheaper fast model for
//! classification and rewriting.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::error::{PipelineError, PipelineResult};

/// Which configured model a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Full model for grounded answer generation.
    Chat,
    /// Cheap model for classification and query rewriting.
    Fast,
}

/// A single prompt sent to a chat model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub tier: ModelTier,
    pub system: Option<String>,
    pub user: String,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run a completion to its end and return the full text.
    async fn complete(&self, req: CompletionRequest) -> PipelineResult<String>;

    /// Stream a completion, sending each text increment into `out` as it
    /// arrives. Returns once the stream ends cleanly or the receiver is
    /// dropped; a mid-stream failure is a terminal error and tokens already
    /// sent are not retracted.
    async fn stream(&self, req: CompletionRequest, out: mpsc::Sender<String>)
        -> PipelineResult<()>;
}

/// OpenAI-compatible chat completions client (`POST {base_url}/chat/completions`).
///
/// Works against the OpenAI API or any server speaking the same protocol.
/// Requires the `OPENAI_API_KEY` environment variable. Temperature is pinned
/// to 0 — classification and rewriting need deterministic output, and
/// grounded answers should not improvise.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    fast_model: String,
    max_retries: u32,
    timeout: Duration,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        // Only a connect timeout on the shared client; streamed generations
        // may legitimately run longer than any fixed total budget.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            chat_model: config.chat_model.clone(),
            fast_model: config.fast_model.clone(),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Chat => &self.chat_model,
            ModelTier::Fast => &self.fast_model,
        }
    }

    fn request_body(&self, req: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": req.user }));

        let mut body = serde_json::json!({
            "model": self.model_for(req.tier),
            "messages": messages,
            "temperature": 0,
            "stream": stream,
        });
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, req: CompletionRequest) -> PipelineResult<String> {
        let body = self.request_body(&req, false);
        let url = format!("{}/chat/completions", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return extract_message_content(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(PipelineError::Model(format!(
                            "chat API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::Model(format!(
                        "chat API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(PipelineError::Model(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| PipelineError::Model("completion failed after retries".into())))
    }

    async fn stream(
        &self,
        req: CompletionRequest,
        out: mpsc::Sender<String>,
    ) -> PipelineResult<()> {
        let body = self.request_body(&req, true);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Model(format!(
                "chat API error {}: {}",
                status, body_text
            )));
        }

        let mut byte_stream = response.bytes_stream();
        let mut buf = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Model(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            // The API emits `data: {json}` lines separated by newlines;
            // a chunk boundary can fall mid-line, so keep the tail buffered.
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                match parse_stream_line(line.trim()) {
                    StreamLine::Delta(text) => {
                        if out.send(text).await.is_err() {
                            // Receiver gone (client disconnected) — stop
                            // producing, nothing more to deliver.
                            return Ok(());
                        }
                    }
                    StreamLine::Done => return Ok(()),
                    StreamLine::Skip => {}
                }
            }
        }

        Ok(())
    }
}

/// Extract `choices[0].message.content` from a non-streamed response.
fn extract_message_content(json: &serde_json::Value) -> PipelineResult<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            PipelineError::MalformedOutput("chat response missing message content".to_string())
        })
}

enum StreamLine {
    Delta(String),
    Done,
    Skip,
}

/// Parse one SSE line from a streamed chat completion.
fn parse_stream_line(line: &str) -> StreamLine {
    let Some(data) = line.strip_prefix("data:") else {
        return StreamLine::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return StreamLine::Done;
    }

    let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
        return StreamLine::Skip;
    };

    match json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
    {
        Some(text) if !text.is_empty() => StreamLine::Delta(text.to_string()),
        _ => StreamLine::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_message_content() {
        let json = serde_json::json!({
            "choices": [ { "message": { "role": "assistant", "content": "RAG" } } ]
        });
        assert_eq!(extract_message_content(&json).unwrap(), "RAG");
    }

    #[test]
    fn test_extract_message_content_missing() {
        let json = serde_json::json!({ "choices": [] });
        assert!(matches!(
            extract_message_content(&json),
            Err(PipelineError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_parse_stream_line_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        match parse_stream_line(line) {
            StreamLine::Delta(text) => assert_eq!(text, "Hel"),
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn test_parse_stream_line_done_and_noise() {
        assert!(matches!(parse_stream_line("data: [DONE]"), StreamLine::Done));
        assert!(matches!(parse_stream_line(""), StreamLine::Skip));
        assert!(matches!(parse_stream_line(": keepalive"), StreamLine::Skip));
        // Role-only delta carries no text
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(matches!(parse_stream_line(line), StreamLine::Skip));
    }
}
