//! # Dossier Intake
//!
//! Document intake and generation-status lifecycle for auction dossiers.
//!
//! Users attach uploaded files, pasted text and links to a dossier. Each
//! attachment becomes a source that moves through
//! `pending → uploading → processing → completed|failed`. The first
//! processable source of a dossier fires a one-time metadata generation;
//! external processing pipelines report progress back through a status
//! callback keyed by `(dossier, document type)`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │ CLI/HTTP │──▶│   Upload     │──▶│ Object store │
//! │          │   │ coordinator  │   │  (S3 / R2)   │
//! └────┬─────┘   └──────┬───────┘   └──────────────┘
//!      │                │
//!      ▼                ▼
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Callback │──▶│    Store     │◀──│    Outbox    │──▶ pipelines
//! │ handler  │   │   (SQLite)   │   │    worker    │
//! └──────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store |
//! | [`services`] | Shared handles built from config |
//! | [`storage`] | Object storage write targets (SigV4 presign, gateway) |
//! | [`pipeline`] | Outbound pipeline clients |
//! | [`registry`] | Source creation and status updates |
//! | [`counter`] | Best-effort upload counter |
//! | [`generation`] | One-time dossier metadata generation |
//! | [`upload`] | Upload coordination for files, text and links |
//! | [`callback`] | Pipeline status callback handling |
//! | [`dossiers`] | Dossier operations and readiness |
//! | [`analysis`] | Checklist analysis results |
//! | [`chat`] | Chat relay |
//! | [`outbox`] | Persistent outbound delivery queue |
//! | [`sweep`] | Stuck-processing sweeper |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI command implementations |

pub mod analysis;
pub mod callback;
pub mod chat;
pub mod commands;
pub mod config;
pub mod counter;
pub mod db;
pub mod dossiers;
pub mod generation;
pub mod migrate;
pub mod outbox;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod services;
pub mod sqlite_store;
pub mod storage;
pub mod sweep;
pub mod upload;
