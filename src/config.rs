// src/config.rs

use log::{info, warn};
use std::path::{Path, PathBuf};

// Extraction
pub const DEFAULT_RETENTION_DAYS: i64 = 90;
pub const DEFAULT_MIN_RATING: i32 = 4;

// Curation
pub const VALIDATION_FRACTION: f64 = 0.2;
pub const SPLIT_SEED: u64 = 42;
// Below this many extracted examples the run halts before training
pub const MIN_TRAINING_EXAMPLES: usize = 100;

// Tokenization
pub const MAX_SEQ_LENGTH: usize = 256;
pub const TOKENIZE_BATCH_SIZE: usize = 1000;

// Training defaults
pub const DEFAULT_EPOCHS: usize = 3;
pub const LEARNING_RATE: f64 = 2e-5;
pub const TRAIN_BATCH_SIZE: usize = 16;
pub const EVAL_BATCH_SIZE: usize = 16;
pub const WEIGHT_DECAY: f64 = 0.01;
pub const WARMUP_STEPS: usize = 100;
pub const SAVE_TOTAL_LIMIT: usize = 2;
pub const EARLY_STOPPING_PATIENCE: usize = 2;

// Locations and identifiers
pub const BASE_MODEL: &str = "neuralmind/bert-base-portuguese-cased";
pub const OUTPUT_DIR: &str = "./models/bert-sentiment-finetuned";
pub const DATA_DIR: &str = "./data/training";
pub const DEFAULT_REGISTRY_REPO: &str = "sosmulheres/bert-sentiment-ptbr";
pub const DEFAULT_REGISTRY_ENDPOINT: &str = "https://huggingface.co";

/// How far the pipeline runs after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Write the snapshot and stop.
    ExportOnly,
    Train,
    TrainAndPublish,
}

impl RunMode {
    pub fn trains(self) -> bool {
        matches!(self, RunMode::Train | RunMode::TrainAndPublish)
    }

    pub fn publishes(self) -> bool {
        matches!(self, RunMode::TrainAndPublish)
    }
}

/// Resolved settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: RunMode,
    pub retention_days: i64,
    pub min_rating: i32,
    pub epochs: usize,
    pub base_model: String,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
    pub repo_id: String,
    /// Replay a previously written snapshot instead of querying the store.
    pub from_snapshot: Option<PathBuf>,
    pub allow_small_dataset: bool,
    pub force_cpu: bool,
    pub registry_endpoint: String,
    pub registry_token: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::ExportOnly,
            retention_days: DEFAULT_RETENTION_DAYS,
            min_rating: DEFAULT_MIN_RATING,
            epochs: DEFAULT_EPOCHS,
            base_model: BASE_MODEL.to_string(),
            output_dir: PathBuf::from(OUTPUT_DIR),
            data_dir: PathBuf::from(DATA_DIR),
            repo_id: DEFAULT_REGISTRY_REPO.to_string(),
            from_snapshot: None,
            allow_small_dataset: false,
            force_cpu: false,
            registry_endpoint: DEFAULT_REGISTRY_ENDPOINT.to_string(),
            registry_token: None,
        }
    }
}

/// Reads the registry token, treating blank values as unset.
pub fn registry_token_from_env() -> Option<String> {
    ["HUGGINGFACE_API_KEY", "HF_TOKEN"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Loads the first `.env` file found, leaving already-set variables alone.
pub fn load_env_files() -> Option<PathBuf> {
    let env_paths = [".env", ".env.local", "../.env"];
    for path in env_paths {
        if Path::new(path).exists() {
            match dotenv::from_path(path) {
                Ok(()) => {
                    info!("Loaded environment variables from {}", path);
                    return Some(PathBuf::from(path));
                }
                Err(e) => warn!("Failed to load environment from {}: {}", path, e),
            }
        }
    }
    info!("No .env file found, using environment variables from system");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_flags() {
        assert!(!RunMode::ExportOnly.trains());
        assert!(RunMode::Train.trains());
        assert!(!RunMode::Train.publishes());
        assert!(RunMode::TrainAndPublish.trains());
        assert!(RunMode::TrainAndPublish.publishes());
    }

    #[test]
    fn test_defaults_match_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.min_rating, 4);
        assert_eq!(config.epochs, 3);
        assert!(config.registry_token.is_none());
    }
}
