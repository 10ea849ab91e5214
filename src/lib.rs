//! # Helpdesk Harness
//!
//! Retrieval and confidence gating for answering support tickets from a
//! fixed set of help documents.
//!
//! Documents are split into sentence-aligned chunks, embedded once, and
//! persisted as a flat inner-product index. Each ticket is triaged for risk
//! signals, analyzed into a category and keywords, answered with ranked
//! evidence from the index, and finally either accepted for automatic
//! response or escalated to a human with a priority.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Documents  │──▶│ Chunk+Embed  │──▶│ vectors.bin  │
//! │ md/txt/pdf │   │  (ingest)    │   │ metadata.json│
//! └────────────┘   └──────────────┘   └──────┬───────┘
//!                                            │
//!   ticket ──▶ triage ──▶ analysis ──▶ retrieve ──▶ confidence gate
//!                                                        │
//!                                   ┌────────────────────┤
//!                                   ▼                    ▼
//!                              ┌──────────┐        ┌──────────┐
//!                              │  SQLite  │        │   HTTP   │
//!                              │ results  │        │  (axum)  │
//!                              └──────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hdx init                                  # create results database
//! hdx index build --docs ./docs             # chunk, embed, persist
//! hdx retrieve "enable two-factor" --analyze
//! hdx ticket "How do I change my plan?"
//! hdx serve                                 # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`extract`] | Text extraction from markdown, text and PDF files |
//! | [`ingest`] | Document discovery, chunking and index building |
//! | [`embedding`] | Embedding providers (hashed, OpenAI, Ollama, fastembed) |
//! | [`index_store`] | Index persistence and integrity checks |
//! | [`triage`] | Coherence and risk-signal screening |
//! | [`analysis`] | Category, keywords and source allow-list for a ticket |
//! | [`policy`] | Model-backed confidence policy |
//! | [`pipeline`] | End-to-end ticket processing |
//! | [`results`] | Outcome, evidence and escalation records |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! The chunker, index, augmenter, retriever and confidence gate live in
//! the `helpdesk-harness-core` crate.

pub mod analysis;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod index_store;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod policy;
pub mod results;
pub mod server;
pub mod triage;
