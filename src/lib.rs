//! # Ragdock
//!
//! A retrieval-augmented chat backend over a document corpus in SQLite.
//!
//! Ragdock routes each chat turn through a layered pipeline: a semantic
//! response cache, a greeting fast path, a query rewriter for follow-ups,
//! a retrieval classifier, and a grounded generator that streams tokens
//! and reconciles `[ref:N]` citation markers against the retrieved
//! passages. Everything persists to one SQLite file; embeddings are stored
//! as BLOBs and compared in Rust.
//!
//! ## Architecture
//!
//! ```text
//!                   ┌────────────────────────────────────┐
//!  POST /chat  ───▶ │ orchestrator (chat)                 │
//!                   │  cache ─ greeting ─ rewrite ─       │
//!                   │  classify ─ retrieve ─ generate     │
//!                   └──────┬───────────────┬─────────────┘
//!                          ▼               ▼
//!                   ┌──────────┐    ┌──────────────┐
//!                   │  SQLite  │    │ OpenAI-compat │
//!                   │ messages │    │ chat + embed  │
//!                   │ passages │    │    APIs       │
//!                   │  cache   │    └──────────────┘
//!                   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error type |
//! | [`models`] | Core data types and stream events |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Chat model abstraction (complete + stream) |
//! | [`index`] | Vector index over passages |
//! | [`cache`] | Semantic response cache |
//! | [`classify`] | Retrieval-vs-chat classification |
//! | [`rewrite`] | Follow-up query rewriting |
//! | [`generate`] | Grounded generation and citations |
//! | [`chat`] | Turn orchestration |
//! | [`store`] | Sessions, messages, users, documents |
//! | [`server`] | HTTP API (JSON + SSE) |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod chat;
pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod index;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod rewrite;
pub mod server;
pub mod store;
