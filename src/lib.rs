//! # docindex
//!
//! Per-document vector indexes for retrieval-augmented question answering.
//!
//! Each registered document gets its own on-disk index: text is extracted,
//! chunked, embedded, and written as a small set of JSON artifacts under a
//! content-addressed directory. Indexes are loaded into a bounded cache on
//! demand, queried through an answer synthesizer, and graded and repaired
//! when their files go missing or drift out of sync with the metadata store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Document  │──▶│ IndexBuilder │──▶│ FileManager   │
//! │ PDF/DOCX/… │   │ chunk+embed  │   │ doc_{id}_{h8} │
//! └────────────┘   └──────┬───────┘   └──────┬────────┘
//!                         │                  │
//!                  ┌──────▼───────┐   ┌──────▼────────┐
//!                  │ MetadataStore│◀──│ QueryEngine   │
//!                  │   (SQLite)   │   │ LRU + breaker │
//!                  └──────▲───────┘   └───────────────┘
//!                         │
//!                  ┌──────┴───────┐
//!                  │ Recovery     │
//!                  │ grade+repair │
//!                  └──────────────┘
//! ```
//!
//! [`coordinator::Coordinator`] ties the pieces together and is what the
//! `dix` binary drives.
//!
//! ## Quick Start
//!
//! ```bash
//! dix init                           # create storage and database
//! dix build notes/design.md          # register and index a document
//! dix query 1 "What is the retry policy?"
//! dix verify 1                       # grade the index on disk
//! dix recover 1                      # repair or rebuild if needed
//! dix health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy and validation reports |
//! | [`extract`] | Text extraction and content hashing |
//! | [`chunk`] | Chunking strategies |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Answer synthesis |
//! | [`provider`] | Index construction, loading and querying |
//! | [`artifact`] | On-disk index format |
//! | [`file_manager`] | Index directory lifecycle |
//! | [`store`] | Metadata persistence |
//! | [`resilience`] | Retry, circuit breaking, cleanup, health probes |
//! | [`index_builder`] | Validated, atomic index builds |
//! | [`query_engine`] | Cached loading and querying |
//! | [`recovery`] | Corruption grading and repair |
//! | [`coordinator`] | Service façade |
//! | [`events`] | Lifecycle notifications |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod artifact;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extract;
pub mod file_manager;
pub mod index_builder;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod provider;
pub mod query_engine;
pub mod recovery;
pub mod resilience;
pub mod similarity;
pub mod stats;
pub mod store;
