use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Connection pool size. SQLite in WAL mode serves concurrent readers;
    /// writes serialize on the file regardless of pool width.
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

fn default_db_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Model used for grounded answer generation.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// Cheaper model used for classification and query rewriting.
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// One-line description of what the assistant is scoped to answer about.
    /// Embedded in prompts so out-of-domain questions are declined.
    #[serde(default = "default_scope")]
    pub scope: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            chat_model: default_chat_model(),
            fast_model: default_fast_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
            scope: default_scope(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_chat_model() -> String {
    "gpt-4.1-mini".to_string()
}
fn default_fast_model() -> String {
    "gpt-4.1-nano".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_scope() -> String {
    "employee reimbursement records".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL for the Ollama provider. Ignored by the OpenAI provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of nearest passages fetched per retrieval turn. Breadth knob:
    /// larger values trade prompt size and cost for recall.
    #[serde(default = "default_k")]
    pub k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

fn default_k() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Maximum squared-L2 distance between a query embedding and a stored
    /// entry for the entry to count as a hit.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            similarity_threshold: default_similarity_threshold(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}
fn default_similarity_threshold() -> f64 {
    0.8
}
fn default_ttl_secs() -> u64 {
    86400 * 7
}

#[derive(Debug, Deserialize, Clone)]
pub struct RewriteConfig {
    /// Queries longer than this many words are treated as self-contained
    /// and never rewritten.
    #[serde(default = "default_max_query_words")]
    pub max_query_words: usize,
    /// Trailing window of formatted history (in characters) passed to the
    /// rewrite prompt.
    #[serde(default = "default_history_window_chars")]
    pub history_window_chars: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            max_query_words: default_max_query_words(),
            history_window_chars: default_history_window_chars(),
        }
    }
}

fn default_max_query_words() -> usize {
    5
}
fn default_history_window_chars() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }

    if config.cache.similarity_threshold <= 0.0 {
        anyhow::bail!("cache.similarity_threshold must be > 0");
    }

    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 for provider '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    if config.rewrite.max_query_words == 0 {
        anyhow::bail!("rewrite.max_query_words must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ragdock.toml");
        std::fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./data/ragdock.sqlite"

[server]
bind = "127.0.0.1:8000"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.db.max_connections, 5);
        assert_eq!(config.retrieval.k, 20);
        assert!(config.cache.enabled);
        assert!((config.cache.similarity_threshold - 0.8).abs() < 1e-9);
        assert_eq!(config.cache.ttl_secs, 86400 * 7);
        assert_eq!(config.rewrite.max_query_words, 5);
        assert_eq!(config.embedding.provider, "openai");
        assert_eq!(config.llm.fast_model, "gpt-4.1-nano");
    }

    #[test]
    fn test_rejects_zero_k() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./data/ragdock.sqlite"

[retrieval]
k = 0

[server]
bind = "127.0.0.1:8000"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_rejects_unknown_embedding_provider() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./data/ragdock.sqlite"

[embedding]
provider = "carrier-pigeon"

[server]
bind = "127.0.0.1:8000"
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
