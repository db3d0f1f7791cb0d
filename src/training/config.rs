// src/training/config.rs

use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_EPOCHS, EARLY_STOPPING_PATIENCE, EVAL_BATCH_SIZE, LEARNING_RATE, MAX_SEQ_LENGTH,
    SAVE_TOTAL_LIMIT, SPLIT_SEED, TRAIN_BATCH_SIZE, WARMUP_STEPS, WEIGHT_DECAY,
};
use crate::error::PipelineError;

/// Metric used to select the best checkpoint. Lower is better.
pub const METRIC_FOR_BEST_MODEL: &str = "eval_loss";

/// Hyperparameters handed to the training engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub weight_decay: f64,
    pub warmup_steps: usize,
    pub save_total_limit: usize,
    pub early_stopping_patience: usize,
    pub metric_for_best_model: String,
    pub max_seq_length: usize,
    /// Seeds per-epoch shuffling and head initialization order.
    pub seed: u64,
    pub force_cpu: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            learning_rate: LEARNING_RATE,
            train_batch_size: TRAIN_BATCH_SIZE,
            eval_batch_size: EVAL_BATCH_SIZE,
            weight_decay: WEIGHT_DECAY,
            warmup_steps: WARMUP_STEPS,
            save_total_limit: SAVE_TOTAL_LIMIT,
            early_stopping_patience: EARLY_STOPPING_PATIENCE,
            metric_for_best_model: METRIC_FOR_BEST_MODEL.to_string(),
            max_seq_length: MAX_SEQ_LENGTH,
            seed: SPLIT_SEED,
            force_cpu: false,
        }
    }
}

impl TrainingConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.epochs == 0 {
            return Err(PipelineError::Config("epochs must be at least 1".into()));
        }
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(PipelineError::Config("batch sizes must be at least 1".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(PipelineError::Config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.save_total_limit == 0 {
            return Err(PipelineError::Config(
                "save_total_limit must keep at least one checkpoint".into(),
            ));
        }
        if self.metric_for_best_model != METRIC_FOR_BEST_MODEL {
            return Err(PipelineError::Config(format!(
                "unsupported best-model metric '{}'",
                self.metric_for_best_model
            )));
        }
        Ok(())
    }

    /// Optimizer steps in one epoch over `num_examples` (last batch may be short).
    pub fn steps_per_epoch(&self, num_examples: usize) -> usize {
        num_examples.div_ceil(self.train_batch_size)
    }

    pub fn total_steps(&self, num_examples: usize) -> usize {
        self.steps_per_epoch(num_examples) * self.epochs
    }
}

/// Linear warmup from 0 to `base_lr` over `warmup_steps`, then linear decay to 0
/// at `total_steps`.
pub fn learning_rate_at(step: usize, warmup_steps: usize, total_steps: usize, base_lr: f64) -> f64 {
    if step < warmup_steps {
        return base_lr * step as f64 / warmup_steps.max(1) as f64;
    }
    let remaining = total_steps.saturating_sub(step) as f64;
    let decay_span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
    base_lr * (remaining / decay_span).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = TrainingConfig::default();
        assert_eq!(config.learning_rate, 2e-5);
        assert_eq!(config.train_batch_size, 16);
        assert_eq!(config.eval_batch_size, 16);
        assert_eq!(config.weight_decay, 0.01);
        assert_eq!(config.warmup_steps, 100);
        assert_eq!(config.save_total_limit, 2);
        assert_eq!(config.early_stopping_patience, 2);
        assert_eq!(config.max_seq_length, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_epochs_is_rejected() {
        let err = TrainingConfig::default().with_epochs(0).validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_steps_round_up() {
        let config = TrainingConfig::default().with_epochs(3);
        assert_eq!(config.steps_per_epoch(400), 25);
        assert_eq!(config.steps_per_epoch(401), 26);
        assert_eq!(config.total_steps(401), 78);
    }

    #[test]
    fn test_warmup_then_linear_decay() {
        let base = 2e-5;
        assert_eq!(learning_rate_at(0, 100, 300, base), 0.0);
        assert!((learning_rate_at(50, 100, 300, base) - 1e-5).abs() < 1e-12);
        assert!((learning_rate_at(100, 100, 300, base) - base).abs() < 1e-12);
        assert!((learning_rate_at(200, 100, 300, base) - 1e-5).abs() < 1e-12);
        assert_eq!(learning_rate_at(300, 100, 300, base), 0.0);
        assert_eq!(learning_rate_at(400, 100, 300, base), 0.0);
    }

    #[test]
    fn test_schedule_shorter_than_warmup_never_exceeds_base() {
        let base = 2e-5;
        for step in 0..40 {
            let lr = learning_rate_at(step, 100, 40, base);
            assert!(lr <= base && lr >= 0.0);
        }
    }
}
