//! # Helpdesk Harness Core
//!
//! Retrieval and ranking core for grounded support-ticket answering:
//! sentence chunking, the embedding index, query augmentation, multi-query
//! retrieval with rerank, and the confidence gate that decides between
//! answering and escalating.
//!
//! This crate performs no filesystem, network, or database I/O. Embedding
//! backends plug in through the [`embedding::Embedder`] trait; persistence
//! of the index and of outcomes lives in the `helpdesk-harness` app crate.

pub mod augment;
pub mod chunk;
pub mod confidence;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod retrieve;
