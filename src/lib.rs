//! # ddq-rs
//!
//! Lease-based distributed work queue over a single Postgres table.
//!
//! Producers `send` messages, deduplicated by a content hash. Any number of
//! listeners poll the table, atomically claim records, keep a lease alive
//! with heartbeats, and remove or requeue what they claimed. Claims whose
//! heartbeat goes stale are returned to the pool by every listener's reaper.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod store;
pub mod telemetry;
