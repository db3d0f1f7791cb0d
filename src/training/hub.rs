// src/training/hub.rs

use anyhow::{Context, Result, anyhow};
use candle_core::{Device, Tensor};
use log::{debug, info};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::decoders::wordpiece::WordPiece as WordPieceDecoder;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::NormalizerWrapper;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::PostProcessorWrapper;
use tokenizers::processors::bert::BertProcessing;

use crate::training::artifact::{MODEL_CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE};
use crate::training::classifier::BertClassifier;
use crate::training::config::TrainingConfig;
use crate::training::engine::{LabelMapping, ModelProvider};

const VOCAB_FILE: &str = "vocab.txt";
const PYTORCH_WEIGHTS_FILE: &str = "pytorch_model.bin";

/// Tokenizer source found for a model.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenizerSource {
    Json(PathBuf),
    /// WordPiece vocabulary without a serialized tokenizer.
    Vocab(PathBuf),
}

/// Weight format found for a model.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightsSource {
    SafeTensors(PathBuf),
    Pytorch(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: TokenizerSource,
    pub weights: WeightsSource,
}

/// Best available device, honoring `force_cpu`.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forced CPU execution mode");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::cuda_if_available(0) {
            Ok(device) if device.is_cuda() => {
                info!("Using CUDA device");
                return device;
            }
            Ok(_) => debug!("CUDA not available"),
            Err(e) => log::warn!("CUDA initialization failed: {}", e),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal device");
                return device;
            }
            Err(e) => log::warn!("Metal not available, falling back to CPU: {}", e),
        }
    }

    info!("No GPU available, using CPU");
    Device::Cpu
}

/// Resolves base models from a local directory or the Hugging Face Hub cache.
pub struct HubModelProvider {
    token: Option<String>,
    force_cpu: bool,
}

impl HubModelProvider {
    pub fn new(token: Option<String>, force_cpu: bool) -> Self {
        Self { token, force_cpu }
    }

    /// Locates config, tokenizer and weights for `model_id`.
    pub fn resolve(&self, model_id: &str) -> Result<ModelFiles> {
        let local = Path::new(model_id);
        if local.is_dir() {
            debug!("Using local model directory {}", local.display());
            return resolve_local(local);
        }
        self.resolve_remote(model_id)
    }

    fn resolve_remote(&self, model_id: &str) -> Result<ModelFiles> {
        let start = Instant::now();
        let api = hf_hub::api::sync::ApiBuilder::new()
            .with_token(self.token.clone())
            .with_progress(false)
            .build()
            .context("Failed to initialize Hugging Face Hub client")?;
        let repo = api.model(model_id.to_string());

        let config = repo
            .get(MODEL_CONFIG_FILE)
            .with_context(|| format!("Failed to fetch {} for {}", MODEL_CONFIG_FILE, model_id))?;
        let tokenizer = match repo.get(TOKENIZER_FILE) {
            Ok(path) => TokenizerSource::Json(path),
            Err(e) => {
                debug!("No {} for {} ({}), trying {}", TOKENIZER_FILE, model_id, e, VOCAB_FILE);
                TokenizerSource::Vocab(
                    repo.get(VOCAB_FILE)
                        .with_context(|| format!("{} has no tokenizer files", model_id))?,
                )
            }
        };
        let weights = match repo.get(WEIGHTS_FILE) {
            Ok(path) => WeightsSource::SafeTensors(path),
            Err(e) => {
                debug!("No {} for {} ({}), trying {}", WEIGHTS_FILE, model_id, e, PYTORCH_WEIGHTS_FILE);
                WeightsSource::Pytorch(
                    repo.get(PYTORCH_WEIGHTS_FILE)
                        .with_context(|| format!("{} has no weight files", model_id))?,
                )
            }
        };

        info!("Resolved {} from the hub in {:.2?}", model_id, start.elapsed());
        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }
}

fn resolve_local(dir: &Path) -> Result<ModelFiles> {
    let config = dir.join(MODEL_CONFIG_FILE);
    if !config.is_file() {
        return Err(anyhow!("{} not found in {}", MODEL_CONFIG_FILE, dir.display()));
    }

    let tokenizer = if dir.join(TOKENIZER_FILE).is_file() {
        TokenizerSource::Json(dir.join(TOKENIZER_FILE))
    } else if dir.join(VOCAB_FILE).is_file() {
        TokenizerSource::Vocab(dir.join(VOCAB_FILE))
    } else {
        return Err(anyhow!("No tokenizer files in {}", dir.display()));
    };

    let weights = if dir.join(WEIGHTS_FILE).is_file() {
        WeightsSource::SafeTensors(dir.join(WEIGHTS_FILE))
    } else if dir.join(PYTORCH_WEIGHTS_FILE).is_file() {
        WeightsSource::Pytorch(dir.join(PYTORCH_WEIGHTS_FILE))
    } else {
        return Err(anyhow!("No weight files in {}", dir.display()));
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

/// Cased BERT WordPiece tokenizer built from a `vocab.txt`.
pub fn wordpiece_tokenizer(vocab: &Path) -> Result<Tokenizer> {
    let vocab_str = vocab
        .to_str()
        .ok_or_else(|| anyhow!("Vocabulary path is not UTF-8: {}", vocab.display()))?;
    let model = WordPiece::from_file(vocab_str)
        .unk_token("[UNK]".to_string())
        .build()
        .map_err(|e| anyhow!("Failed to read WordPiece vocabulary {}: {}", vocab.display(), e))?;

    let mut tokenizer = Tokenizer::new(model);
    let cls = tokenizer
        .token_to_id("[CLS]")
        .ok_or_else(|| anyhow!("Vocabulary has no [CLS] token"))?;
    let sep = tokenizer
        .token_to_id("[SEP]")
        .ok_or_else(|| anyhow!("Vocabulary has no [SEP] token"))?;

    tokenizer.with_normalizer(NormalizerWrapper::from(BertNormalizer::new(
        true,
        true,
        Some(false),
        false,
    )));
    tokenizer.with_pre_tokenizer(PreTokenizerWrapper::from(BertPreTokenizer));
    tokenizer.with_post_processor(PostProcessorWrapper::from(BertProcessing::new(
        ("[SEP]".to_string(), sep),
        ("[CLS]".to_string(), cls),
    )));
    tokenizer.with_decoder(DecoderWrapper::from(WordPieceDecoder::default()));
    Ok(tokenizer)
}

fn load_weights(source: &WeightsSource, device: &Device) -> Result<HashMap<String, Tensor>> {
    match source {
        WeightsSource::SafeTensors(path) => candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load weights from {}", path.display())),
        WeightsSource::Pytorch(path) => {
            let tensors = candle_core::pickle::read_all(path)
                .with_context(|| format!("Failed to read weights from {}", path.display()))?;
            tensors
                .into_iter()
                .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
                .collect()
        }
    }
}

impl ModelProvider for HubModelProvider {
    type Engine = BertClassifier;

    fn load_tokenizer(&self, model_id: &str) -> Result<Tokenizer> {
        let files = self.resolve(model_id)?;
        match &files.tokenizer {
            TokenizerSource::Json(path) => Tokenizer::from_file(path)
                .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e)),
            TokenizerSource::Vocab(path) => {
                info!("Building WordPiece tokenizer from {}", path.display());
                wordpiece_tokenizer(path)
            }
        }
    }

    fn load_classifier(
        &self,
        model_id: &str,
        labels: &LabelMapping,
        config: &TrainingConfig,
        num_train_examples: usize,
    ) -> Result<BertClassifier> {
        let files = self.resolve(model_id)?;
        let device = select_device(self.force_cpu || config.force_cpu);

        let base_config: Value = serde_json::from_slice(
            &fs::read(&files.config)
                .with_context(|| format!("Failed to read {}", files.config.display()))?,
        )
        .context("Failed to parse model config JSON")?;

        let start = Instant::now();
        let weights = load_weights(&files.weights, &device)?;
        info!(
            "Loaded {} base tensors in {:.2?}",
            weights.len(),
            start.elapsed()
        );

        BertClassifier::new(
            base_config,
            &weights,
            labels,
            config,
            num_train_examples,
            device,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_directory_prefers_json_and_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        for file in [MODEL_CONFIG_FILE, TOKENIZER_FILE, VOCAB_FILE, WEIGHTS_FILE, PYTORCH_WEIGHTS_FILE] {
            fs::write(dir.path().join(file), b"{}").unwrap();
        }

        let files = resolve_local(dir.path()).unwrap();
        assert_eq!(files.tokenizer, TokenizerSource::Json(dir.path().join(TOKENIZER_FILE)));
        assert_eq!(files.weights, WeightsSource::SafeTensors(dir.path().join(WEIGHTS_FILE)));
    }

    #[test]
    fn test_local_directory_falls_back_to_vocab_and_pytorch() {
        let dir = tempfile::tempdir().unwrap();
        for file in [MODEL_CONFIG_FILE, VOCAB_FILE, PYTORCH_WEIGHTS_FILE] {
            fs::write(dir.path().join(file), b"{}").unwrap();
        }

        let files = resolve_local(dir.path()).unwrap();
        assert_eq!(files.tokenizer, TokenizerSource::Vocab(dir.path().join(VOCAB_FILE)));
        assert_eq!(files.weights, WeightsSource::Pytorch(dir.path().join(PYTORCH_WEIGHTS_FILE)));
    }

    #[test]
    fn test_local_directory_without_weights_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MODEL_CONFIG_FILE), b"{}").unwrap();
        fs::write(dir.path().join(TOKENIZER_FILE), b"{}").unwrap();
        assert!(resolve_local(dir.path()).is_err());
    }

    #[test]
    fn test_wordpiece_tokenizer_adds_special_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = dir.path().join(VOCAB_FILE);
        fs::write(&vocab, "[PAD]\n[UNK]\n[CLS]\n[SEP]\nestou\ntriste\n##s\n").unwrap();

        let tokenizer = wordpiece_tokenizer(&vocab).unwrap();
        let encoding = tokenizer.encode("estou tristes", true).unwrap();
        assert_eq!(encoding.get_ids(), &[2, 4, 5, 6, 3]);
    }

    #[test]
    fn test_forced_cpu() {
        assert!(matches!(select_device(true), Device::Cpu));
    }

    #[test]
    #[ignore = "downloads the base model from the Hugging Face Hub"]
    fn test_resolve_default_base_model() {
        let provider = HubModelProvider::new(None, true);
        let files = provider.resolve(crate::config::BASE_MODEL).unwrap();
        assert!(files.config.is_file());
        let tokenizer = provider.load_tokenizer(crate::config::BASE_MODEL).unwrap();
        assert!(tokenizer.get_vocab_size(true) > 1000);
    }
}
