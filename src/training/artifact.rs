// src/training/artifact.rs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const METADATA_FILE: &str = "metadata.json";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const MODEL_CONFIG_FILE: &str = "config.json";

const STAGING_PREFIX: &str = ".staging-";

/// Run metadata persisted next to the weights.
///
/// Its presence marks the output directory as a complete artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: Uuid,
    pub base_model: String,
    pub trained_at: DateTime<Utc>,
    pub num_train_examples: usize,
    pub num_val_examples: usize,
    pub eval_loss: f64,
    /// Configured epoch budget.
    pub epochs: usize,
    pub emotion_labels: Vec<String>,
    pub best_epoch: usize,
    pub epochs_completed: usize,
    pub stopped_early: bool,
}

/// Per-epoch history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub eval_loss: f64,
    pub eval_accuracy: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub log_history: Vec<EpochRecord>,
    pub best_epoch: usize,
    pub best_eval_loss: f64,
    pub metric_for_best_model: String,
    pub stopped_early: bool,
    /// Trained on a GPU; weights are F32 either way.
    pub accelerated: bool,
}

pub fn read_metadata(dir: &Path) -> Result<TrainingRun> {
    let path = dir.join(METADATA_FILE);
    let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Malformed metadata {}", path.display()))
}

/// True when `dir` holds a fully promoted artifact.
pub fn is_complete(dir: &Path) -> bool {
    dir.join(METADATA_FILE).is_file()
}

/// Hidden run-local directory that becomes the artifact on promotion.
///
/// Dropped without `promote`, the staging directory is removed and the
/// output directory keeps whatever it held before the run.
#[derive(Debug)]
pub struct ArtifactStaging {
    output_dir: PathBuf,
    staging_dir: PathBuf,
    promoted: bool,
}

impl ArtifactStaging {
    pub fn create(output_dir: &Path, run_id: Uuid) -> Result<Self> {
        let staging_dir = output_dir.join(format!("{}{}", STAGING_PREFIX, run_id));
        if staging_dir.exists() {
            fs::remove_dir_all(&staging_dir).with_context(|| {
                format!("Failed to clear stale staging dir {}", staging_dir.display())
            })?;
        }
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("Failed to create staging dir {}", staging_dir.display()))?;
        debug!("Staging artifact in {}", staging_dir.display());
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            staging_dir,
            promoted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.staging_dir
    }

    pub fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<PathBuf> {
        let path = self.staging_dir.join(file_name);
        let json = serde_json::to_vec_pretty(value)
            .with_context(|| format!("Failed to serialize {}", file_name))?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Moves staged files into the output directory, metadata last.
    ///
    /// Any previous `metadata.json` is removed first, so an interrupted
    /// promotion leaves a directory that does not claim to be complete.
    pub fn promote(mut self, run: &TrainingRun) -> Result<PathBuf> {
        let old_metadata = self.output_dir.join(METADATA_FILE);
        if old_metadata.exists() {
            fs::remove_file(&old_metadata).with_context(|| {
                format!("Failed to retire previous {}", old_metadata.display())
            })?;
        }

        for entry in fs::read_dir(&self.staging_dir)? {
            let entry = entry?;
            let target = self.output_dir.join(entry.file_name());
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            }
            fs::rename(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to move {} into {}",
                    entry.path().display(),
                    self.output_dir.display()
                )
            })?;
        }

        let staged_metadata = self.write_json(METADATA_FILE, run)?;
        fs::rename(&staged_metadata, &old_metadata)
            .with_context(|| format!("Failed to publish {}", old_metadata.display()))?;

        fs::remove_dir_all(&self.staging_dir).with_context(|| {
            format!("Failed to remove staging dir {}", self.staging_dir.display())
        })?;
        self.promoted = true;
        info!("Model artifact written to {}", self.output_dir.display());
        Ok(self.output_dir.clone())
    }
}

impl Drop for ArtifactStaging {
    fn drop(&mut self) {
        if self.promoted || !self.staging_dir.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.staging_dir) {
            warn!(
                "Could not remove staging dir {}: {}",
                self.staging_dir.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> TrainingRun {
        TrainingRun {
            run_id: Uuid::new_v4(),
            base_model: "neuralmind/bert-base-portuguese-cased".into(),
            trained_at: Utc::now(),
            num_train_examples: 400,
            num_val_examples: 100,
            eval_loss: 0.61,
            epochs: 3,
            emotion_labels: crate::labels::label_names(),
            best_epoch: 2,
            epochs_completed: 3,
            stopped_early: false,
        }
    }

    #[test]
    fn test_promote_moves_files_and_writes_metadata() {
        let output = tempfile::tempdir().unwrap();
        let staging = ArtifactStaging::create(output.path(), Uuid::new_v4()).unwrap();
        fs::write(staging.path().join(WEIGHTS_FILE), b"weights").unwrap();
        staging.write_json(MODEL_CONFIG_FILE, &serde_json::json!({"num_labels": 7})).unwrap();
        let staging_path = staging.path().to_path_buf();

        let metadata = run();
        let dir = staging.promote(&metadata).unwrap();

        assert!(is_complete(&dir));
        assert_eq!(read_metadata(&dir).unwrap(), metadata);
        assert_eq!(fs::read(dir.join(WEIGHTS_FILE)).unwrap(), b"weights");
        assert!(!staging_path.exists());
    }

    #[test]
    fn test_dropped_staging_leaves_previous_artifact() {
        let output = tempfile::tempdir().unwrap();
        let previous = run();
        fs::write(
            output.path().join(METADATA_FILE),
            serde_json::to_vec(&previous).unwrap(),
        )
        .unwrap();

        let staging_path = {
            let staging = ArtifactStaging::create(output.path(), Uuid::new_v4()).unwrap();
            fs::write(staging.path().join(WEIGHTS_FILE), b"partial").unwrap();
            staging.path().to_path_buf()
        };

        assert!(!staging_path.exists());
        assert!(!output.path().join(WEIGHTS_FILE).exists());
        assert_eq!(read_metadata(output.path()).unwrap(), previous);
    }

    #[test]
    fn test_metadata_uses_documented_field_names() {
        let value = serde_json::to_value(run()).unwrap();
        for field in [
            "base_model",
            "trained_at",
            "num_train_examples",
            "num_val_examples",
            "eval_loss",
            "epochs",
            "emotion_labels",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
    }
}
