//! # ragline
//!
//! A multi-tenant grounded-answer service. A question is answered from the
//! asking tenant's own indexed documents, through a prioritized list of
//! language-model providers each guarded by a circuit breaker, with answers
//! cached per tenant. The same pipeline serves a voice WebSocket.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP /v1/query ─┐                      ┌──────────────┐
//!                  ├─▶ Orchestrator ─────▶│ ResponseCache│ (per tenant, TTL)
//!  WS /v1/voice ───┘   │   ▲              └──────────────┘
//!   (VoiceSession ─ STT)│   │
//!                      ▼   │              ┌──────────────┐
//!                  Retriever ────────────▶│ VectorStore  │ memory | sqlite
//!                      │                  └──────────────┘
//!                      ▼
//!                   Router ──▶ [breaker] primary ──▶ [breaker] fallback ──▶ …
//! ```
//!
//! Every long-lived component is built once in [`service::ServiceContext`]
//! and shared by handle.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Domain error taxonomy |
//! | [`chunk`] | Paragraph text chunking |
//! | [`embedding`] | Embedder abstraction (hash, OpenAI, Ollama, local) |
//! | [`retriever`] | Tenant-scoped vector index and top-k search |
//! | [`cache`] | Tenant-scoped response cache |
//! | [`breaker`] | Per-provider circuit breaker |
//! | [`llm`] | Completion provider adapters |
//! | [`router`] | Priority routing across breakers |
//! | [`rate_limit`] | Per-caller sliding-window limits |
//! | [`orchestrator`] | The query pipeline |
//! | [`stt`] | Speech-to-text backends |
//! | [`voice`] | Voice session state machine and frames |
//! | [`auth`] | Identity headers and signatures |
//! | [`service`] | Service context and status |
//! | [`server`] | HTTP and WebSocket server |
//! | [`ingest`] | File ingestion for the CLI |
//! | [`db`] / [`migrate`] | SQLite connection and schema |

pub mod auth;
pub mod breaker;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod retriever;
pub mod router;
pub mod server;
pub mod service;
pub mod stt;
pub mod voice;
