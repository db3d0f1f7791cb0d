// src/training/engine.rs

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokenizers::Tokenizer;

use crate::labels::{self, NUM_LABELS};
use crate::training::config::TrainingConfig;
use crate::training::tokenization::TokenizedDataset;

/// Validation metrics for one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// Aggregates from one pass over the training split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub train_loss: f64,
    pub learning_rate: f64,
    pub steps: usize,
}

/// Label wiring baked into the classification head.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMapping {
    pub num_labels: usize,
    pub id2label: BTreeMap<String, String>,
    pub label2id: BTreeMap<String, u32>,
}

impl LabelMapping {
    /// The fixed emotion vocabulary.
    pub fn emotions() -> Self {
        Self {
            num_labels: NUM_LABELS,
            id2label: labels::id2label(),
            label2id: labels::label2id(),
        }
    }
}

/// A sequence classifier that can be trained, evaluated and persisted.
///
/// Engine failures are returned as-is; callers do not retry.
pub trait ClassifierEngine {
    /// One pass over `train` in shuffled mini-batches.
    fn train_epoch(&mut self, epoch: usize, train: &TokenizedDataset) -> Result<EpochStats>;

    fn evaluate(&self, data: &TokenizedDataset) -> Result<EvalMetrics>;

    /// Writes the current weights under `dir` (created if missing).
    fn save_checkpoint(&self, dir: &Path) -> Result<()>;

    /// Loads weights previously written by `save_checkpoint`.
    fn restore_checkpoint(&mut self, dir: &Path) -> Result<()>;

    /// Writes deployable weights and the self-describing model config.
    fn save_pretrained(&self, dir: &Path) -> Result<()>;

    /// Whether training runs on a GPU. Compute precision is unaffected.
    fn accelerated(&self) -> bool {
        false
    }
}

/// Resolves a base model identifier into a tokenizer and a trainable classifier.
pub trait ModelProvider {
    type Engine: ClassifierEngine;

    fn load_tokenizer(&self, model_id: &str) -> Result<Tokenizer>;

    /// # Arguments
    /// * `model_id` - Base model identifier or local directory
    /// * `labels` - Output classes and their names
    /// * `config` - Optimizer and schedule settings
    /// * `num_train_examples` - Used to size the learning-rate schedule
    fn load_classifier(
        &self,
        model_id: &str,
        labels: &LabelMapping,
        config: &TrainingConfig,
        num_train_examples: usize,
    ) -> Result<Self::Engine>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emotion_mapping_has_one_class_per_label() {
        let mapping = LabelMapping::emotions();
        assert_eq!(mapping.num_labels, 7);
        assert_eq!(mapping.id2label.len(), 7);
        assert_eq!(mapping.label2id.len(), 7);
        for (id, name) in &mapping.id2label {
            assert_eq!(mapping.label2id[name].to_string(), *id);
        }
    }
}
