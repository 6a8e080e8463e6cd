//! Event-driven dataset ingestion and analysis pipeline.
//!
//! Producers write datasets into a versioned object store; writes under the
//! watched prefix become messages on a dispatch queue with visibility
//! timeouts and a dead-letter queue; consumers analyse each referenced object.

pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
