//! # labelops
//!
//! Resumable, rate-adaptive bulk mutation and reconciliation of tagged
//! remote objects: chunked mutation with adaptive throttling and retry
//! classification, a durable job ledger, per-account processing, and
//! tag-driven discovery and repair.

pub mod accounts;
pub mod auto_queue;
pub mod config;
pub mod db;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod governor;
pub mod ledger;
pub mod models;
pub mod mutator;
pub mod orchestrator;
pub mod processor;
pub mod remote;
pub mod repositories;
pub mod retry;
pub mod tags;
pub mod telemetry;
pub mod templates;
pub use migration;
