// src/labels.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed vocabulary of mood categories the classifier predicts.
///
/// The stored form (`as_str`) is the value written by the analyzer into
/// `ai_response_logs.sentiment_emotion`. Ids are dense and follow declaration
/// order, so `EMOTION_LABELS[label.id()] == label` for every label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EmotionLabel {
    #[serde(rename = "desesperada")]
    Despair,
    #[serde(rename = "triste")]
    Sadness,
    #[serde(rename = "ansiosa")]
    Anxiety,
    #[serde(rename = "raiva")]
    Anger,
    #[serde(rename = "feliz")]
    Happiness,
    #[serde(rename = "esperancosa")]
    Hopefulness,
    #[serde(rename = "confusa")]
    Confusion,
}

/// The full vocabulary in id order.
pub const EMOTION_LABELS: [EmotionLabel; 7] = [
    EmotionLabel::Despair,
    EmotionLabel::Sadness,
    EmotionLabel::Anxiety,
    EmotionLabel::Anger,
    EmotionLabel::Happiness,
    EmotionLabel::Hopefulness,
    EmotionLabel::Confusion,
];

pub const NUM_LABELS: usize = EMOTION_LABELS.len();

impl EmotionLabel {
    /// Dense integer id used as the classifier target.
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        EMOTION_LABELS.get(id as usize).copied()
    }

    /// The label as stored in the feedback store and written to artifacts.
    pub fn as_str(self) -> &'static str {
        match self {
            EmotionLabel::Despair => "desesperada",
            EmotionLabel::Sadness => "triste",
            EmotionLabel::Anxiety => "ansiosa",
            EmotionLabel::Anger => "raiva",
            EmotionLabel::Happiness => "feliz",
            EmotionLabel::Hopefulness => "esperancosa",
            EmotionLabel::Confusion => "confusa",
        }
    }

    pub fn english_name(self) -> &'static str {
        match self {
            EmotionLabel::Despair => "despair",
            EmotionLabel::Sadness => "sadness",
            EmotionLabel::Anxiety => "anxiety",
            EmotionLabel::Anger => "anger",
            EmotionLabel::Happiness => "happiness",
            EmotionLabel::Hopefulness => "hopefulness",
            EmotionLabel::Confusion => "confusion",
        }
    }

    /// Strict lookup against the stored vocabulary only.
    pub fn from_stored(value: &str) -> Option<Self> {
        EMOTION_LABELS.iter().copied().find(|l| l.as_str() == value)
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownLabel(pub String);

impl FromStr for EmotionLabel {
    type Err = UnknownLabel;

    /// Accepts the stored form or the English name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmotionLabel::from_stored(s)
            .or_else(|| EMOTION_LABELS.iter().copied().find(|l| l.english_name() == s))
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// `id -> name` map in the shape serving code expects (`"0": "desesperada"`).
pub fn id2label() -> BTreeMap<String, String> {
    EMOTION_LABELS
        .iter()
        .map(|l| (l.id().to_string(), l.as_str().to_string()))
        .collect()
}

/// `name -> id` map, the inverse of [`id2label`].
pub fn label2id() -> BTreeMap<String, u32> {
    EMOTION_LABELS
        .iter()
        .map(|l| (l.as_str().to_string(), l.id()))
        .collect()
}

/// Vocabulary names in id order, as persisted in run metadata.
pub fn label_names() -> Vec<String> {
    EMOTION_LABELS.iter().map(|l| l.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_id_round_trip() {
        for label in EMOTION_LABELS {
            assert_eq!(EmotionLabel::from_id(label.id()), Some(label));
        }
        assert_eq!(EmotionLabel::from_id(NUM_LABELS as u32), None);
    }

    #[test]
    fn test_ids_are_dense() {
        let ids: Vec<u32> = EMOTION_LABELS.iter().map(|l| l.id()).collect();
        assert_eq!(ids, (0..7).collect::<Vec<u32>>());
    }

    #[test]
    fn test_parse_stored_and_english() {
        assert_eq!("triste".parse::<EmotionLabel>(), Ok(EmotionLabel::Sadness));
        assert_eq!("sadness".parse::<EmotionLabel>(), Ok(EmotionLabel::Sadness));
        assert!("melancholic".parse::<EmotionLabel>().is_err());
        // Strict lookup only knows the stored vocabulary
        assert_eq!(EmotionLabel::from_stored("sadness"), None);
    }

    #[test]
    fn test_maps_are_inverse() {
        let forward = id2label();
        let backward = label2id();
        assert_eq!(forward.len(), NUM_LABELS);
        for (id, name) in &forward {
            assert_eq!(backward[name].to_string(), *id);
        }
    }

    #[test]
    fn test_serde_uses_stored_form() {
        let json = serde_json::to_string(&EmotionLabel::Hopefulness).unwrap();
        assert_eq!(json, "\"esperancosa\"");
        let back: EmotionLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EmotionLabel::Hopefulness);
    }
}
