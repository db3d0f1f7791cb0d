// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::EmotionLabel;

//------------------------------------------------------------------------------
// FEEDBACK STORE RECORDS
//------------------------------------------------------------------------------

/// The interaction a feedback rating refers to (`ai_response_logs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionLog {
    pub user_message: Option<String>,
    pub predicted_emotion: Option<String>,
    /// In [0, 1] when present.
    pub predicted_intensity: Option<f64>,
}

/// A user rating joined with its interaction log (`ai_feedback` + `log_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: String,
    /// 1..=5
    pub rating: i32,
    pub created_at: DateTime<Utc>,
    /// `None` when the join found no log row.
    pub interaction: Option<InteractionLog>,
}

//------------------------------------------------------------------------------
// DATASET ROWS
//------------------------------------------------------------------------------

/// A complete join that survived extraction, before label validation.
///
/// This is also the row shape of the persisted snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExample {
    pub text: String,
    pub label: String,
    pub intensity: Option<f64>,
    pub rating: i32,
    pub feedback_date: DateTime<Utc>,
}

/// A validated example with its label resolved against the vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedExample {
    pub text: String,
    pub label: EmotionLabel,
    pub intensity: Option<f64>,
    pub rating: i32,
    pub feedback_date: DateTime<Utc>,
    pub label_id: u32,
}

impl CuratedExample {
    pub fn from_raw(raw: RawExample, label: EmotionLabel) -> Self {
        Self {
            text: raw.text,
            label,
            intensity: raw.intensity,
            rating: raw.rating,
            feedback_date: raw.feedback_date,
            label_id: label.id(),
        }
    }
}

//------------------------------------------------------------------------------
// STAGE SUMMARIES
//------------------------------------------------------------------------------

/// What the extractor fetched and why rows were discarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub fetched: usize,
    pub kept: usize,
    pub dropped_missing_log: usize,
    pub dropped_missing_message: usize,
    pub dropped_missing_emotion: usize,
    /// Raw label value -> count, before vocabulary validation.
    pub label_distribution: BTreeMap<String, usize>,
}

impl ExtractionSummary {
    /// Summary of rows that are already known to be complete (snapshot replay).
    pub fn from_rows(rows: &[RawExample]) -> Self {
        let mut label_distribution = BTreeMap::new();
        for row in rows {
            *label_distribution.entry(row.label.clone()).or_insert(0) += 1;
        }
        Self {
            fetched: rows.len(),
            kept: rows.len(),
            label_distribution,
            ..Default::default()
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped_missing_log + self.dropped_missing_message + self.dropped_missing_emotion
    }
}
