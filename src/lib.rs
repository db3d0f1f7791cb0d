// src/lib.rs

pub mod cli;
pub mod config;
pub mod curation;
pub mod db;
pub mod error;
pub mod labels;
pub mod models;
pub mod pipeline;
pub mod publisher;
pub mod training;

pub use error::PipelineError;
pub use labels::EmotionLabel;
pub use pipeline::{Pipeline, PipelineOutcome};
