//! # Solr Reindex Library
//!
//! Orchestration core for bulk Solr reindexing: a cursor tracker over the
//! source sort key, a batch copier, the per-job state machine run by
//! [`worker::ReindexWorker`], an execution dispatcher, and a job registry
//! whose writes are compare-and-set.

pub mod config;
pub mod copier;
pub mod cursor;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod server;
pub mod solr;
pub mod telemetry;
pub mod worker;
pub use migration;
