// src/training/tokenization.rs

use anyhow::anyhow;
use log::{debug, info};
use std::time::Instant;
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::config::{MAX_SEQ_LENGTH, TOKENIZE_BATCH_SIZE};
use crate::error::PipelineError;
use crate::models::CuratedExample;

/// Model-ready example. The raw text is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: u32,
}

/// A split after tokenization. Every example has exactly `max_length` tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenizedDataset {
    pub examples: Vec<TokenizedExample>,
    pub max_length: usize,
    /// Examples whose text did not fit and was cut.
    pub truncated: usize,
}

impl TokenizedDataset {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Row-major ids, mask and labels for the given example indices.
    pub fn gather(&self, indices: &[usize]) -> (Vec<u32>, Vec<u32>, Vec<u32>) {
        let mut input_ids = Vec::with_capacity(indices.len() * self.max_length);
        let mut attention_mask = Vec::with_capacity(indices.len() * self.max_length);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            let example = &self.examples[i];
            input_ids.extend_from_slice(&example.input_ids);
            attention_mask.extend_from_slice(&example.attention_mask);
            labels.push(example.labels);
        }
        (input_ids, attention_mask, labels)
    }
}

/// Fixes right padding and truncation to `max_length` on the tokenizer.
///
/// The pad token is taken from the vocabulary (`[PAD]`), falling back to id 0.
pub fn configure_tokenizer(tokenizer: &mut Tokenizer, max_length: usize) {
    let pad_token = "[PAD]".to_string();
    let pad_id = tokenizer.token_to_id(&pad_token).unwrap_or(0);

    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(max_length),
        direction: PaddingDirection::Right,
        pad_id,
        pad_token,
        ..Default::default()
    }));
    tokenizer.with_truncation(Some(TruncationParams {
        max_length,
        ..Default::default()
    }));
}

/// Converts curated examples into fixed-length token sequences.
pub struct TokenizationStage {
    tokenizer: Tokenizer,
    max_length: usize,
    batch_size: usize,
}

impl TokenizationStage {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self::with_limits(tokenizer, MAX_SEQ_LENGTH, TOKENIZE_BATCH_SIZE)
    }

    pub fn with_limits(mut tokenizer: Tokenizer, max_length: usize, batch_size: usize) -> Self {
        configure_tokenizer(&mut tokenizer, max_length);
        Self {
            tokenizer,
            max_length,
            batch_size: batch_size.max(1),
        }
    }

    /// The configured tokenizer, saved alongside the model weights.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Tokenizes a split in batches, consuming the examples.
    ///
    /// # Arguments
    /// * `name` - Split name used in log lines
    /// * `examples` - Curated examples; text is dropped once encoded
    ///
    /// # Returns
    /// * `Result<TokenizedDataset, PipelineError>` - Examples in input order
    pub fn tokenize(
        &self,
        name: &str,
        examples: Vec<CuratedExample>,
    ) -> Result<TokenizedDataset, PipelineError> {
        let start = Instant::now();
        let mut dataset = TokenizedDataset {
            examples: Vec::with_capacity(examples.len()),
            max_length: self.max_length,
            truncated: 0,
        };

        for (batch_index, chunk) in examples.chunks(self.batch_size).enumerate() {
            let texts: Vec<&str> = chunk.iter().map(|e| e.text.as_str()).collect();
            let encodings = self
                .tokenizer
                .encode_batch(texts, true)
                .map_err(|e| {
                    PipelineError::Tokenization(anyhow!(
                        "Failed to encode {} batch {}: {}",
                        name,
                        batch_index,
                        e
                    ))
                })?;

            for (example, encoding) in chunk.iter().zip(encodings) {
                if encoding.get_ids().len() != self.max_length {
                    return Err(PipelineError::Tokenization(anyhow!(
                        "Encoding has {} tokens, expected {}",
                        encoding.get_ids().len(),
                        self.max_length
                    )));
                }
                if !encoding.get_overflowing().is_empty() {
                    dataset.truncated += 1;
                }
                dataset.examples.push(TokenizedExample {
                    input_ids: encoding.get_ids().to_vec(),
                    attention_mask: encoding.get_attention_mask().to_vec(),
                    labels: example.label_id,
                });
            }
            debug!("Tokenized {} batch {} ({} texts)", name, batch_index, chunk.len());
        }

        info!(
            "Tokenized {} {} examples in {:.2?} ({} truncated to {} tokens)",
            dataset.len(),
            name,
            start.elapsed(),
            dataset.truncated,
            self.max_length
        );
        Ok(dataset)
    }
}
