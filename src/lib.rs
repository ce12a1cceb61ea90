//! # rapport
//!
//! A relationship-intelligence layer over a contact database.
//!
//! rapport derives four things for every contact and keeps them in the
//! contact row: a communication summary aggregated from message threads,
//! dense embeddings of the profile and of the contact's interests, scored
//! intelligence tags from a structured-output completion service, and the
//! retrieval queries that combine them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │   comms      │──▶│   embed    │──▶│    tag     │──▶│   search   │
//! │ (aggregator) │   │ (vectors)  │   │ (A / B / C)│   │ (RRF, RPC) │
//! └──────────────┘   └────────────┘   └────────────┘   └────────────┘
//!          ╲                 │                 │               ▲
//!           ╲────────────────┴─────────────────┴──▶ SQLite ────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rapport init
//! rapport comms summarize
//! rapport embed
//! rapport tag profile --workers 8
//! rapport tag overlap
//! rapport tag closeness
//! rapport search "climate investors" --mode hybrid
//! rapport serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Contacts, threads, comms summaries |
//! | [`intel`] | Intelligence profile, overlap and closeness types |
//! | [`store`] | Storage trait with SQLite and in-memory backends |
//! | [`comms`] | Communication aggregator |
//! | [`documents`] | Profile and interests text for embedding |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embed_cmd`] | Embedding job |
//! | [`completion`] | Structured-output completion service |
//! | [`tagger`] | Worker pool and the three tagging variants |
//! | [`search`] | Interests match, hybrid search, RRF |
//! | [`server`] | HTTP RPC server |
//! | [`retry`] | Backoff policy for external calls |
//! | [`job`] | Run options, tallies and summaries |

pub mod comms;
pub mod completion;
pub mod config;
pub mod db;
pub mod documents;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod intel;
pub mod job;
pub mod jsonish;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retry;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod tagger;
