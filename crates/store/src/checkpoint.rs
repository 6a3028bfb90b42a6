use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use adlts_ml::ForecasterSnapshot;
use adlts_models::{EngineError, Result};
use adlts_rl::{PolicySnapshot, ReplayStats};

/// Bumped whenever the on-disk layout changes shape. Loads refuse any other
/// version instead of guessing at a migration.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Everything needed to resume a session: the policy (weights, step count,
/// exploration rate), per-symbol forecaster parameters, and summary stats of
/// the replay buffer. The buffer contents themselves are not persisted, a
/// restored agent refills it from live ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub policy: PolicySnapshot,
    pub forecasters: BTreeMap<String, ForecasterSnapshot>,
    pub replay: ReplayStats,
}

impl Checkpoint {
    pub fn new(
        policy: PolicySnapshot,
        forecasters: BTreeMap<String, ForecasterSnapshot>,
        replay: ReplayStats,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            created_at: Utc::now(),
            policy,
            forecasters,
            replay,
        }
    }
}

/// How often checkpoints are cut and where they land.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/checkpoint.json"),
            interval_secs: 300,
        }
    }
}

/// Reads and writes the checkpoint file. Saves go through a temp file and a
/// rename so a crash mid-write leaves the previous checkpoint intact.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(
            path = %self.path.display(),
            steps = checkpoint.policy.state.steps,
            forecasters = checkpoint.forecasters.len(),
            "💾 checkpoint saved"
        );
        Ok(())
    }

    /// `Ok(None)` when no checkpoint exists yet; any other read or parse
    /// failure is an error so a corrupt file is never silently ignored.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::Io(e)),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&raw)?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(EngineError::Checkpoint(format!(
                "unsupported schema version {} in {} (expected {})",
                checkpoint.schema_version,
                self.path.display(),
                CHECKPOINT_SCHEMA_VERSION
            )));
        }
        info!(
            path = %self.path.display(),
            created_at = %checkpoint.created_at,
            steps = checkpoint.policy.state.steps,
            "📂 checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }
}
