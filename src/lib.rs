//! # docquery
//!
//! Grounded question answering over single documents.
//!
//! A query names one indexed document, a few search keywords and a
//! question. The keywords and the question are embedded separately, each
//! vector retrieves the closest chunks of that document, the two result
//! blocks are merged without repeated lines, and a local model answers the
//! question from the merged context. Every answer is kept in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────────────┐
//! │ CLI / HTTP │──▶│     App      │──▶│ Query / Inference /   │
//! │  requests  │   │ task + token │   │ Ingest pipelines      │
//! └────────────┘   └──────┬───────┘   └──────────┬────────────┘
//!                         │                      │
//!                         ▼                      ▼
//!                  ┌────────────┐   ┌────────────────────────────┐
//!                  │  progress  │   │ embedder · Elasticsearch · │
//!                  │   events   │   │ completer · SQLite store   │
//!                  └────────────┘   └────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Requests, generation options, stored records |
//! | [`error`] | Error taxonomy and codes |
//! | [`process`] | Cancellable subprocess runner |
//! | [`embedding`] | Embedding executable wrapper |
//! | [`completion`] | Single-flight completion executable wrapper |
//! | [`search`] | Elasticsearch kNN retrieval and indexing |
//! | [`dedup`] | Line-level merge of result blocks |
//! | [`prompt`] | Prompt templates |
//! | [`pipeline`] | Document query pipeline |
//! | [`inference`] | Plain completion pipeline |
//! | [`ingest`] | Document import pipeline |
//! | [`chunk`] | Text chunking |
//! | [`extract`] | Text and PDF loading |
//! | [`progress`] | Progress and response events |
//! | [`cancel`] | Per-request operation contexts |
//! | [`app`] | Request dispatch |
//! | [`server`] | HTTP event transport |
//! | [`store`] | Question persistence |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod cancel;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod inference;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod search;
pub mod server;
pub mod store;
