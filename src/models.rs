//! Core data models used throughout ragdock.
//!
//! These types represent the sessions, messages, passages, and stream events
//! that flow through the chat pipeline.

use serde::{Deserialize, Serialize};

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// A chat session owned by a user.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: i64,
}

/// A single persisted chat turn. Assistant content is stored with citation
/// markers already stripped.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: i64,
}

/// Registry row for an uploaded document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub chunk_count: i64,
    pub created_at: i64,
}

/// A passage returned from the vector index, ordered ascending by distance.
/// Distance is the index's native metric (squared L2), not bounded to [0,1].
#[derive(Debug, Clone)]
pub struct Passage {
    pub text: String,
    pub source: String,
    pub distance: f64,
}

/// A source entry displayed alongside a generated answer. `number` is the
/// 1-based position in the display list, not the citation reference number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitedSource {
    pub number: usize,
    pub source: String,
    /// Display-only similarity percentage in (0, 100], derived from distance.
    pub similarity: f64,
}

/// A discrete event on the chat stream.
///
/// Wire contract: `session_id` exactly once and first, `token` zero or more
/// times, `sources` at most once after generation, then exactly one of
/// `done` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    SessionId { session_id: String },
    Token { content: String },
    Sources { sources: Vec<SourceEntry> },
    Done { cached: bool },
    Error { message: String },
}

/// Serializable form of [`CitedSource`] carried by the `sources` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub number: usize,
    pub source: String,
    pub similarity: f64,
}

impl From<CitedSource> for SourceEntry {
    fn from(c: CitedSource) -> Self {
        SourceEntry {
            number: c.number,
            source: c.source,
            similarity: c.similarity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        assert_eq!(MessageRole::parse("user"), Some(MessageRole::User));
        assert_eq!(
            MessageRole::parse(MessageRole::Assistant.as_str()),
            Some(MessageRole::Assistant)
        );
        assert_eq!(MessageRole::parse("system"), None);
    }

    #[test]
    fn test_stream_event_wire_tags() {
        let ev = StreamEvent::SessionId {
            session_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "session_id");
        assert_eq!(json["session_id"], "abc");

        let ev = StreamEvent::Token {
            content: "hi".to_string(),
        };
        assert_eq!(serde_json::to_value(&ev).unwrap()["type"], "token");

        let ev = StreamEvent::Done { cached: true };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["cached"], true);

        let ev = StreamEvent::Error {
            message: "boom".to_string(),
        };
        assert_eq!(serde_json::to_value(&ev).unwrap()["type"], "error");
    }

    #[test]
    fn test_sources_event_shape() {
        let ev = StreamEvent::Sources {
            sources: vec![SourceEntry {
                number: 1,
                source: "report.pdf".to_string(),
                similarity: 81.9,
            }],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "sources");
        assert_eq!(json["sources"][0]["source"], "report.pdf");
    }
}
