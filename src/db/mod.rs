pub mod catalog;
pub mod connection;
pub mod memory;
pub mod migrations;
pub mod queries;

pub use catalog::SiteCatalog;
pub use connection::Database;
pub use memory::{MemoryStore, ScriptedOrchestrator, ScriptedTelemetry};
