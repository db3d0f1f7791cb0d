// src/curation/mod.rs

pub mod curator;
pub mod extractor;
pub mod snapshot;

pub use curator::{DatasetCurator, DatasetSplit, LabelValidation};
pub use extractor::{Extraction, FeedbackStore, PgFeedbackStore, RecordExtractor};
