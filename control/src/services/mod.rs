pub mod auth;
pub mod collector;
pub mod config_builder;
pub mod deployment_store;
pub mod heartbeat_monitor;
pub mod node_registry;
pub mod orchestrator;
pub mod quantity;

use rusqlite::Row;
use serde::de::DeserializeOwned;

pub use collector::Collector;
pub use config_builder::ConfigBuilder;
pub use heartbeat_monitor::heartbeat_monitor;
pub use orchestrator::{Orchestrator, OrchestratorConfig};

/// Decode a JSON text column.
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
