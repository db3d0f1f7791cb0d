// src/curation/curator.rs

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

use crate::config::{SPLIT_SEED, VALIDATION_FRACTION};
use crate::error::PipelineError;
use crate::labels::EmotionLabel;
use crate::models::{CuratedExample, RawExample};

/// Rows that passed vocabulary validation plus what was filtered out.
#[derive(Debug, Clone, Default)]
pub struct LabelValidation {
    pub examples: Vec<CuratedExample>,
    /// Unrecognized label value -> number of rows dropped for it.
    pub unknown_labels: BTreeMap<String, usize>,
}

impl LabelValidation {
    pub fn dropped(&self) -> usize {
        self.unknown_labels.values().sum()
    }
}

/// Disjoint train/validation partition.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit {
    pub train: Vec<CuratedExample>,
    pub validation: Vec<CuratedExample>,
}

/// Validates labels and performs the seeded stratified split.
#[derive(Debug, Clone)]
pub struct DatasetCurator {
    validation_fraction: f64,
    seed: u64,
}

impl Default for DatasetCurator {
    fn default() -> Self {
        Self::new(VALIDATION_FRACTION, SPLIT_SEED)
    }
}

impl DatasetCurator {
    pub fn new(validation_fraction: f64, seed: u64) -> Self {
        Self {
            validation_fraction,
            seed,
        }
    }

    /// Keeps rows whose label is in the vocabulary and resolves their ids.
    ///
    /// Unknown labels are a warning, never an error: they usually mean the
    /// upstream analyzer started emitting a category this model lacks.
    pub fn validate_labels(&self, rows: Vec<RawExample>) -> LabelValidation {
        info!("Validating labels of {} rows", rows.len());
        let mut result = LabelValidation::default();
        result.examples.reserve(rows.len());

        for row in rows {
            match EmotionLabel::from_stored(&row.label) {
                Some(label) => result.examples.push(CuratedExample::from_raw(row, label)),
                None => *result.unknown_labels.entry(row.label).or_insert(0) += 1,
            }
        }

        if !result.unknown_labels.is_empty() {
            let names: Vec<&str> = result.unknown_labels.keys().map(String::as_str).collect();
            warn!(
                "Invalid labels found, dropped {} rows: {:?}",
                result.dropped(),
                names
            );
        }
        result
    }

    /// Stratified split with a fixed fraction and seed.
    ///
    /// Every label present gets at least one example on each side, so a label
    /// with fewer than 2 examples makes the split impossible. Identical input
    /// always yields the identical partition.
    pub fn split(&self, examples: Vec<CuratedExample>) -> Result<DatasetSplit, PipelineError> {
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(PipelineError::Config(format!(
                "validation fraction must be in (0, 1), got {}",
                self.validation_fraction
            )));
        }
        if examples.is_empty() {
            return Err(PipelineError::EmptySplit {
                train: 0,
                validation: 0,
            });
        }

        let mut by_label: BTreeMap<EmotionLabel, Vec<CuratedExample>> = BTreeMap::new();
        for example in examples {
            by_label.entry(example.label).or_default().push(example);
        }

        if let Some((label, members)) = by_label.iter().find(|(_, members)| members.len() < 2) {
            return Err(PipelineError::StratificationImpossible {
                label: *label,
                count: members.len(),
            });
        }

        let counts: Vec<usize> = by_label.values().map(Vec::len).collect();
        let allocation = allocate_validation(&counts, self.validation_fraction);

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut train = Vec::new();
        let mut validation = Vec::new();
        for ((label, mut members), n_val) in by_label.into_iter().zip(allocation) {
            members.shuffle(&mut rng);
            let rest = members.split_off(n_val);
            debug!(
                "Label {}: {} train / {} validation",
                label,
                rest.len(),
                members.len()
            );
            validation.extend(members);
            train.extend(rest);
        }
        train.shuffle(&mut rng);
        validation.shuffle(&mut rng);

        info!("Train: {} examples", train.len());
        info!("Val: {} examples", validation.len());
        Ok(DatasetSplit { train, validation })
    }
}

/// Per-class validation sizes summing to `ceil(total * fraction)`.
///
/// Floors of the proportional share are topped up by largest remainder (ties
/// to the lower class index), then clamped to `1..=count-1`.
fn allocate_validation(counts: &[usize], fraction: f64) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    let target = ((total as f64) * fraction - 1e-9).ceil() as usize;

    let shares: Vec<f64> = counts.iter().map(|&c| c as f64 * fraction).collect();
    let mut allocation: Vec<usize> = shares.iter().map(|s| s.floor() as usize).collect();

    let assigned: usize = allocation.iter().sum();
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = shares[a] - shares[a].floor();
        let rb = shares[b] - shares[b].floor();
        rb.partial_cmp(&ra)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    for &index in order.iter().take(target.saturating_sub(assigned)) {
        allocation[index] += 1;
    }

    for (n_val, &count) in allocation.iter_mut().zip(counts) {
        *n_val = (*n_val).clamp(1, count - 1);
    }
    allocation
}
