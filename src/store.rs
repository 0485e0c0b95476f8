//! SQLite persistence for users, sessions, messages, and documents.
//!
//! Free async functions over a shared pool, one per query. Embedding-aware
//! access (passages, cache entries) lives in [`crate::index`] and
//! [`crate::cache`]; this module is everything else.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{ChatMessage, ChatSession, DocumentRecord, MessageRole};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: String,
    pub created_at: i64,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

pub async fn create_user(pool: &SqlitePool, username: &str, role: &str) -> Result<User> {
    let user = User {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        role: role.to_string(),
        created_at: Utc::now().timestamp(),
    };
    sqlx::query("INSERT INTO users (id, username, role, created_at) VALUES (?, ?, ?, ?)")
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.role)
        .bind(user.created_at)
        .execute(pool)
        .await?;
    Ok(user)
}

pub async fn get_user(pool: &SqlitePool, user_id: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, username, role, created_at FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| User {
        id: r.get("id"),
        username: r.get("username"),
        role: r.get("role"),
        created_at: r.get("created_at"),
    }))
}

pub async fn get_user_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, username, role, created_at FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| User {
        id: r.get("id"),
        username: r.get("username"),
        role: r.get("role"),
        created_at: r.get("created_at"),
    }))
}

/// Create a session titled with the leading characters of the first query.
pub async fn create_session(pool: &SqlitePool, user_id: &str, title: &str) -> Result<ChatSession> {
    let session = ChatSession {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        title: title.to_string(),
        created_at: Utc::now().timestamp(),
    };
    sqlx::query("INSERT INTO chat_sessions (id, user_id, title, created_at) VALUES (?, ?, ?, ?)")
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(session.created_at)
        .execute(pool)
        .await?;
    Ok(session)
}

/// Owner user id of a session, or `None` if the session does not exist.
pub async fn session_owner(pool: &SqlitePool, session_id: &str) -> Result<Option<String>> {
    let owner: Option<String> =
        sqlx::query_scalar("SELECT user_id FROM chat_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(pool)
            .await?;
    Ok(owner)
}

/// All sessions belonging to a user, newest first.
pub async fn list_sessions(pool: &SqlitePool, user_id: &str) -> Result<Vec<ChatSession>> {
    let rows = sqlx::query(
        "SELECT id, user_id, title, created_at FROM chat_sessions
         WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| ChatSession {
            id: r.get("id"),
            user_id: r.get("user_id"),
            title: r.get("title"),
            created_at: r.get("created_at"),
        })
        .collect())
}

/// Rename a session. Returns false if the session does not exist.
pub async fn update_session_title(
    pool: &SqlitePool,
    session_id: &str,
    title: &str,
) -> Result<bool> {
    let result = sqlx::query("UPDATE chat_sessions SET title = ? WHERE id = ?")
        .bind(title)
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a session and all its messages.
pub async fn delete_session(pool: &SqlitePool, session_id: &str) -> Result<bool> {
    sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn append_message(
    pool: &SqlitePool,
    session_id: &str,
    user_id: &str,
    role: MessageRole,
    content: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO chat_messages (session_id, user_id, role, content, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(role.as_str())
    .bind(content)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Messages of a session in insertion order. Rows with an unknown role
/// value are skipped rather than failing the whole fetch.
pub async fn session_history(pool: &SqlitePool, session_id: &str) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        "SELECT role, content, created_at FROM chat_messages
         WHERE session_id = ? ORDER BY id ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .filter_map(|r| {
            let role: String = r.get("role");
            Some(ChatMessage {
                role: MessageRole::parse(&role)?,
                content: r.get("content"),
                created_at: r.get("created_at"),
            })
        })
        .collect())
}

/// Render history as the "role: content" lines the rewriter and generator
/// prompts expect.
pub fn format_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn insert_document(
    pool: &SqlitePool,
    id: &str,
    filename: &str,
    chunk_count: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO documents (id, filename, chunk_count, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(filename)
    .bind(chunk_count)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Paginated document listing, newest first, optionally filtered by a
/// case-insensitive filename substring.
pub async fn list_documents(
    pool: &SqlitePool,
    search: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<DocumentRecord>> {
    let pattern = search.map(|s| format!("%{}%", s));
    let rows = match &pattern {
        Some(p) => {
            sqlx::query(
                "SELECT id, filename, chunk_count, created_at FROM documents
                 WHERE filename LIKE ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(p)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, filename, chunk_count, created_at FROM documents
                 ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows
        .iter()
        .map(|r| DocumentRecord {
            id: r.get("id"),
            filename: r.get("filename"),
            chunk_count: r.get("chunk_count"),
            created_at: r.get("created_at"),
        })
        .collect())
}

pub async fn document_count(pool: &SqlitePool, search: Option<&str>) -> Result<i64> {
    let count: i64 = match search {
        Some(s) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE filename LIKE ?")
                .bind(format!("%{}%", s))
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

pub async fn get_document(pool: &SqlitePool, document_id: &str) -> Result<Option<DocumentRecord>> {
    let row =
        sqlx::query("SELECT id, filename, chunk_count, created_at FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| DocumentRecord {
        id: r.get("id"),
        filename: r.get("filename"),
        chunk_count: r.get("chunk_count"),
        created_at: r.get("created_at"),
    }))
}

pub async fn delete_document_record(pool: &SqlitePool, document_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_history_role_prefixes() {
        let messages = vec![
            ChatMessage {
                role: MessageRole::User,
                content: "reimburse Angga".to_string(),
                created_at: 0,
            },
            ChatMessage {
                role: MessageRole::Assistant,
                content: "Found 3 claims.".to_string(),
                created_at: 1,
            },
        ];
        assert_eq!(
            format_history(&messages),
            "user: reimburse Angga\nassistant: Found 3 claims."
        );
    }

    #[test]
    fn test_format_history_empty() {
        assert_eq!(format_history(&[]), "");
    }
}
