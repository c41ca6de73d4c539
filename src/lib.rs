//! Periodic PBIS rewards collection.
//!
//! A collection run reads every TA team and its students' uncounted cards,
//! advances personal and team levels, draws weighted prize winners while
//! skipping recent winners, and writes the results back through a
//! [`store::PersistenceGateway`] one checkpointed step at a time.

pub mod collection;
pub mod config;
pub mod db;
pub mod error;
pub mod levels;
pub mod lottery;
#[cfg(test)]
mod memory;
pub mod models;
pub mod report;
pub mod snapshot;
pub mod store;

pub use collection::{build_plan, Collector};
pub use config::EngineConfig;
pub use error::{CollectionError, GatewayError};
pub use models::{CardAverage, CollectionPlan, CollectionRecord, CollectionSummary, Snapshot};
