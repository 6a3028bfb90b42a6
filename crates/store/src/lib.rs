//! Persistence for the trading engine: session checkpoints and the external
//! configuration store. Everything here is plain JSON on disk so operators
//! can inspect and edit state with ordinary tools.

pub mod checkpoint;
pub mod config_store;

pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore, CHECKPOINT_SCHEMA_VERSION};
pub use config_store::{get_typed, ConfigStore, JsonFileConfigStore, MemoryConfigStore};
