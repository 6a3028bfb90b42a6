use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use adlts_models::{EngineError, Result};

/// External key-value store for tunables (risk thresholds, RL
/// hyperparameters). Never carries trading logic, only values read at
/// startup or written by operator tooling.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The stored value, or `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Deserializes a stored value into a concrete type.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn ConfigStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => {
            let typed = serde_json::from_value(value)
                .map_err(|e| EngineError::Config(format!("config key '{key}': {e}")))?;
            Ok(Some(typed))
        }
        None => Ok(None),
    }
}

/// In-process store, used in tests and as the default when no file path is
/// configured.
#[derive(Default)]
pub struct MemoryConfigStore {
    entries: DashMap<String, Value>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON object on disk. Writes are whole-file read-modify-write under a
/// lock, flushed through a temp file and rename so a crash mid-write never
/// leaves a torn store behind.
pub struct JsonFileConfigStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    async fn read_entries(&self) -> Result<Map<String, Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(EngineError::Io(e)),
        };
        let value: Value = serde_json::from_str(&raw)?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(EngineError::Config(format!(
                "config store {} holds {} instead of an object",
                self.path.display(),
                match other {
                    Value::Array(_) => "an array",
                    Value::Null => "null",
                    _ => "a scalar",
                }
            ))),
        }
    }

    async fn write_entries(&self, entries: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&Value::Object(entries.clone()))?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _held = self.guard.lock().await;
        let entries = self.read_entries().await?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _held = self.guard.lock().await;
        let mut entries = self.read_entries().await?;
        entries.insert(key.to_string(), value);
        self.write_entries(&entries).await?;
        debug!(key, path = %self.path.display(), "config value stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryConfigStore::new();
        assert_eq!(store.get("risk.max_fraction").await.unwrap(), None);

        store.set("risk.max_fraction", json!(0.1)).await.unwrap();
        assert_eq!(
            store.get("risk.max_fraction").await.unwrap(),
            Some(json!(0.1))
        );

        let typed: Option<f64> = get_typed(&store, "risk.max_fraction").await.unwrap();
        assert_eq!(typed, Some(0.1));
    }

    #[tokio::test]
    async fn test_typed_mismatch_is_config_error() {
        let store = MemoryConfigStore::new();
        store.set("rl.batch_size", json!("not a number")).await.unwrap();

        let typed: Result<Option<u32>> = get_typed(&store, "rl.batch_size").await;
        assert!(matches!(typed, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "adlts_config_test_{}.json",
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));

        {
            let store = JsonFileConfigStore::new(&path);
            store.set("trading.symbol", json!("BTC/USDT")).await.unwrap();
            store.set("rl.epsilon_floor", json!(0.01)).await.unwrap();
        }

        let reopened = JsonFileConfigStore::new(&path);
        assert_eq!(
            reopened.get("trading.symbol").await.unwrap(),
            Some(json!("BTC/USDT"))
        );
        assert_eq!(
            reopened.get("rl.epsilon_floor").await.unwrap(),
            Some(json!(0.01))
        );
        assert_eq!(reopened.get("absent").await.unwrap(), None);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
