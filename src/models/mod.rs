//! Core data models for the dispatch pipeline.
//!
//! Buckets and stored objects map to SQLite rows via `sqlx::FromRow`.
//! Notification events and queue messages only ever live in memory.

pub mod bucket;
pub mod event;
pub mod message;
pub mod object;
