// src/training/checkpoint.rs

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const CHECKPOINT_META_FILE: &str = "checkpoint.json";

/// Directory of the checkpoint written after `epoch`.
pub fn checkpoint_dir(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir
        .join(CHECKPOINTS_DIR)
        .join(format!("checkpoint-epoch-{}", epoch))
}

/// What a checkpoint directory holds besides the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: usize,
    pub eval_loss: f64,
    pub eval_accuracy: f64,
    #[serde(skip)]
    pub path: PathBuf,
}

impl CheckpointRecord {
    pub fn write_meta(&self) -> Result<()> {
        let meta_path = self.path.join(CHECKPOINT_META_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&meta_path, json)
            .with_context(|| format!("Failed to write {}", meta_path.display()))
    }

    pub fn read_meta(dir: &Path) -> Result<Self> {
        let meta_path = dir.join(CHECKPOINT_META_FILE);
        let bytes = fs::read(&meta_path)
            .with_context(|| format!("Failed to read {}", meta_path.display()))?;
        let mut record: CheckpointRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed checkpoint metadata {}", meta_path.display()))?;
        record.path = dir.to_path_buf();
        Ok(record)
    }
}

/// Keeps at most `limit` checkpoints, evicting the oldest first.
///
/// The checkpoint currently holding the best metric is never evicted, so the
/// retained set can be the best one plus the most recent ones.
#[derive(Debug)]
pub struct CheckpointRetention {
    limit: usize,
    retained: VecDeque<CheckpointRecord>,
}

impl CheckpointRetention {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            retained: VecDeque::new(),
        }
    }

    /// Registers a freshly written checkpoint and returns the ones to delete.
    pub fn register(
        &mut self,
        record: CheckpointRecord,
        best_epoch: Option<usize>,
    ) -> Vec<CheckpointRecord> {
        self.retained.push_back(record);
        let mut evicted = Vec::new();
        while self.retained.len() > self.limit {
            let victim = self
                .retained
                .iter()
                .position(|c| Some(c.epoch) != best_epoch);
            match victim.and_then(|i| self.retained.remove(i)) {
                Some(record) => {
                    debug!("Evicting checkpoint for epoch {}", record.epoch);
                    evicted.push(record);
                }
                None => break,
            }
        }
        evicted
    }

    pub fn retained_epochs(&self) -> Vec<usize> {
        self.retained.iter().map(|c| c.epoch).collect()
    }

    pub fn get(&self, epoch: usize) -> Option<&CheckpointRecord> {
        self.retained.iter().find(|c| c.epoch == epoch)
    }
}

/// Stops training once validation loss has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best_loss: f64,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: f64::INFINITY,
            epochs_without_improvement: 0,
        }
    }

    /// Records an evaluation; returns true when it improved on the best so far.
    ///
    /// Equal losses are not an improvement, so the earliest minimum stays best.
    pub fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best_loss - self.min_delta {
            self.best_loss = loss;
            self.epochs_without_improvement = 0;
            true
        } else {
            self.epochs_without_improvement += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.patience > 0 && self.epochs_without_improvement >= self.patience
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }
}

/// Deletes evicted checkpoint directories.
pub fn remove_checkpoints(evicted: &[CheckpointRecord]) -> Result<()> {
    for record in evicted {
        if record.path.exists() {
            fs::remove_dir_all(&record.path).with_context(|| {
                format!("Failed to remove checkpoint {}", record.path.display())
            })?;
        }
    }
    Ok(())
}
