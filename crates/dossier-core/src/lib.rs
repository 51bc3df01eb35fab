//! # Dossier Core
//!
//! Runtime-free logic for Dossier Intake: data models, the source and
//! generation lifecycle rules, the store abstraction, and an in-memory store.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The service
//! crate supplies a SQLite-backed [`store::Store`] and the outbound
//! pipeline clients.

pub mod error;
pub mod lifecycle;
pub mod models;
pub mod store;
