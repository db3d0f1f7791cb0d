// src/cli.rs

use clap::Parser;
use std::path::PathBuf;

use crate::config::{
    BASE_MODEL, DATA_DIR, DEFAULT_EPOCHS, DEFAULT_MIN_RATING, DEFAULT_REGISTRY_ENDPOINT,
    DEFAULT_REGISTRY_REPO, DEFAULT_RETENTION_DAYS, OUTPUT_DIR, PipelineConfig, RunMode,
};

/// Fine-tunes the emotion classifier on positively rated conversations.
///
/// Without `--train` or `--upload` the run stops after the CSV snapshot.
#[derive(Debug, Parser)]
#[command(name = "feedback_finetune")]
#[command(version)]
pub struct Cli {
    /// Only export feedback to a CSV snapshot
    #[arg(long, conflicts_with_all = ["train", "upload"])]
    pub export_only: bool,

    /// Train a model on the exported feedback
    #[arg(long)]
    pub train: bool,

    /// Train, then upload the artifact to the model registry
    #[arg(long)]
    pub upload: bool,

    /// Retention window in days
    #[arg(long, env = "FEEDBACK_RETENTION_DAYS", default_value_t = DEFAULT_RETENTION_DAYS)]
    pub days: i64,

    /// Number of training epochs
    #[arg(long, env = "TRAINING_EPOCHS", default_value_t = DEFAULT_EPOCHS)]
    pub epochs: usize,

    /// Minimum user rating (1-5) for a conversation to be used
    #[arg(long, env = "FEEDBACK_MIN_RATING", default_value_t = DEFAULT_MIN_RATING)]
    pub min_rating: i32,

    /// Base model id on the hub, or a local model directory
    #[arg(long, env = "BASE_MODEL", default_value = BASE_MODEL)]
    pub base_model: String,

    #[arg(long, env = "MODEL_OUTPUT_DIR", default_value = OUTPUT_DIR)]
    pub output_dir: PathBuf,

    #[arg(long, env = "TRAINING_DATA_DIR", default_value = DATA_DIR)]
    pub data_dir: PathBuf,

    /// Registry repository receiving the artifact
    #[arg(long, env = "HF_REPO_ID", default_value = DEFAULT_REGISTRY_REPO)]
    pub repo_id: String,

    /// Train from an existing snapshot instead of querying the database
    #[arg(long)]
    pub from_snapshot: Option<PathBuf>,

    /// Train even with fewer than 100 usable examples
    #[arg(long)]
    pub allow_small_dataset: bool,

    #[arg(long)]
    pub force_cpu: bool,

    #[arg(long, env = "HF_ENDPOINT", default_value = DEFAULT_REGISTRY_ENDPOINT)]
    pub registry_endpoint: String,
}

impl Cli {
    pub fn mode(&self) -> RunMode {
        if self.upload {
            RunMode::TrainAndPublish
        } else if self.train {
            RunMode::Train
        } else {
            RunMode::ExportOnly
        }
    }

    pub fn into_config(self, registry_token: Option<String>) -> PipelineConfig {
        PipelineConfig {
            mode: self.mode(),
            retention_days: self.days,
            min_rating: self.min_rating,
            epochs: self.epochs,
            base_model: self.base_model,
            output_dir: self.output_dir,
            data_dir: self.data_dir,
            repo_id: self.repo_id,
            from_snapshot: self.from_snapshot,
            allow_small_dataset: self.allow_small_dataset,
            force_cpu: self.force_cpu,
            registry_endpoint: self.registry_endpoint,
            registry_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_flags_is_export_only() {
        let cli = Cli::try_parse_from(["feedback_finetune"]).unwrap();
        assert_eq!(cli.mode(), RunMode::ExportOnly);
        assert_eq!(cli.days, 90);
        assert_eq!(cli.epochs, 3);
    }

    #[test]
    fn test_upload_implies_training() {
        let cli = Cli::try_parse_from(["feedback_finetune", "--upload", "--epochs", "5"]).unwrap();
        assert_eq!(cli.mode(), RunMode::TrainAndPublish);
        let config = cli.into_config(Some("hf_x".into()));
        assert!(config.mode.trains());
        assert_eq!(config.epochs, 5);
        assert_eq!(config.registry_token.as_deref(), Some("hf_x"));
    }

    #[test]
    fn test_export_only_conflicts_with_train() {
        assert!(Cli::try_parse_from(["feedback_finetune", "--export-only", "--train"]).is_err());
    }

    #[test]
    fn test_snapshot_replay_flags() {
        let cli = Cli::try_parse_from([
            "feedback_finetune",
            "--train",
            "--from-snapshot",
            "data/training/training_data_20261015_080000.csv",
            "--allow-small-dataset",
            "--days",
            "30",
        ])
        .unwrap();
        let config = cli.into_config(None);
        assert_eq!(config.mode, RunMode::Train);
        assert!(config.allow_small_dataset);
        assert_eq!(config.retention_days, 30);
        assert!(config.from_snapshot.is_some());
    }
}
