// src/training/mod.rs

pub mod artifact;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod hub;
pub mod orchestrator;
pub mod tokenization;

pub use config::TrainingConfig;
pub use engine::{ClassifierEngine, EpochStats, EvalMetrics, LabelMapping, ModelProvider};
pub use orchestrator::{TrainingOrchestrator, TrainingReport, TrainingState};
pub use tokenization::{TokenizationStage, TokenizedDataset, TokenizedExample};
