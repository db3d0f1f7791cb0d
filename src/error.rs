// src/error.rs

use crate::labels::EmotionLabel;

/// Fatal pipeline failures.
///
/// Empty inputs and data-quality findings are not represented here: they are
/// reported through stage summaries and `PipelineOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(
        "Cannot stratify split: label '{label}' has {count} example(s), at least 2 are required"
    )]
    StratificationImpossible { label: EmotionLabel, count: usize },

    #[error("Training needs non-empty splits (train={train}, validation={validation})")]
    EmptySplit { train: usize, validation: usize },

    #[error("Feedback extraction failed: {0:#}")]
    Extraction(#[source] anyhow::Error),

    #[error("Snapshot I/O failed: {0:#}")]
    Snapshot(#[source] anyhow::Error),

    #[error("Tokenization failed: {0:#}")]
    Tokenization(#[source] anyhow::Error),

    #[error("Failed to load base model '{model_id}': {source:#}")]
    ModelLoad {
        model_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Training engine failed at epoch {epoch}: {source:#}")]
    Training {
        epoch: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to persist model artifact: {0:#}")]
    Artifact(#[source] anyhow::Error),

    #[error("Publishing to '{repo_id}' failed: {source:#}")]
    Publish {
        repo_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Configuration errors are raised before any stage runs.
    pub fn is_configuration(&self) -> bool {
        matches!(self, PipelineError::MissingEnv(_) | PipelineError::Config(_))
    }
}
