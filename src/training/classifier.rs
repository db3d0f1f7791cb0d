// src/training/classifier.rs

use anyhow::{Context, Result, anyhow, bail};
use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::training::artifact::{MODEL_CONFIG_FILE, WEIGHTS_FILE};
use crate::training::config::{TrainingConfig, learning_rate_at};
use crate::training::engine::{ClassifierEngine, EpochStats, EvalMetrics, LabelMapping};
use crate::training::tokenization::TokenizedDataset;

pub const SEQUENCE_CLASSIFICATION_ARCH: &str = "BertForSequenceClassification";

const DEFAULT_CLASSIFIER_DROPOUT: f64 = 0.1;

/// BERT encoder, tanh pooler and a linear head over the `[CLS]` position.
///
/// Variable names follow the `BertForSequenceClassification` layout
/// (`bert.*`, `classifier.*`) so saved weights load in other runtimes.
pub struct BertClassifier {
    bert: BertModel,
    pooler: Linear,
    classifier: Linear,
    dropout: f32,
    varmap: VarMap,
    /// Weight matrices and embeddings.
    decayed: AdamW,
    /// Biases and LayerNorm parameters.
    undecayed: AdamW,
    device: Device,
    base_config: Value,
    labels: LabelMapping,
    config: TrainingConfig,
    total_steps: usize,
    step: usize,
}

impl BertClassifier {
    /// Builds the classifier and copies the pretrained encoder weights into it.
    ///
    /// # Arguments
    /// * `base_config` - The base model's `config.json`
    /// * `weights` - Pretrained tensors keyed by their checkpoint names
    /// * `labels` - Output classes; the head is freshly initialized
    /// * `config` - Optimizer and schedule settings
    /// * `num_train_examples` - Sizes the learning-rate schedule
    /// * `device` - Device every tensor lives on
    pub fn new(
        base_config: Value,
        weights: &HashMap<String, Tensor>,
        labels: &LabelMapping,
        config: &TrainingConfig,
        num_train_examples: usize,
        device: Device,
    ) -> Result<Self> {
        let bert_config: BertConfig = serde_json::from_value(base_config.clone())
            .context("Failed to parse BERT configuration")?;
        let hidden_size = base_config
            .get("hidden_size")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("config.json has no hidden_size"))? as usize;
        let dropout = base_config
            .get("classifier_dropout")
            .and_then(Value::as_f64)
            .or_else(|| base_config.get("hidden_dropout_prob").and_then(Value::as_f64))
            .unwrap_or(DEFAULT_CLASSIFIER_DROPOUT) as f32;

        if let Err(e) = device.set_seed(config.seed) {
            debug!("Device RNG not seeded: {}", e);
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bert = BertModel::load(vb.pp("bert"), &bert_config)
            .context("Failed to build BERT encoder")?;
        let pooler = candle_nn::linear(hidden_size, hidden_size, vb.pp("bert.pooler.dense"))?;
        let classifier = candle_nn::linear(hidden_size, labels.num_labels, vb.pp("classifier"))?;

        load_pretrained(&varmap, weights)?;

        let (decay_vars, no_decay_vars) = parameter_groups(&varmap)?;
        debug!(
            "{} variables with weight decay, {} without",
            decay_vars.len(),
            no_decay_vars.len()
        );
        let decayed = AdamW::new(
            decay_vars,
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let undecayed = AdamW::new(
            no_decay_vars,
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        let total_steps = config.total_steps(num_train_examples);
        info!(
            "Classifier head: {} -> {} classes, dropout {}, {} optimizer steps planned",
            hidden_size, labels.num_labels, dropout, total_steps
        );

        Ok(Self {
            bert,
            pooler,
            classifier,
            dropout,
            varmap,
            decayed,
            undecayed,
            device,
            base_config,
            labels: labels.clone(),
            config: config.clone(),
            total_steps,
            step: 0,
        })
    }

    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self
            .bert
            .forward(input_ids, &token_type_ids, Some(attention_mask))?;
        let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let pooled = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&pooled, self.dropout)?
        } else {
            pooled
        };
        Ok(self.classifier.forward(&pooled)?)
    }

    fn batch(&self, data: &TokenizedDataset, indices: &[usize]) -> Result<(Tensor, Tensor, Tensor)> {
        let (ids, mask, labels) = data.gather(indices);
        let shape = (indices.len(), data.max_length);
        let input_ids = Tensor::from_vec(ids, shape, &self.device)?;
        let attention_mask = Tensor::from_vec(mask, shape, &self.device)?;
        let labels = Tensor::from_vec(labels, indices.len(), &self.device)?;
        Ok((input_ids, attention_mask, labels))
    }
}

impl ClassifierEngine for BertClassifier {
    fn train_epoch(&mut self, epoch: usize, train: &TokenizedDataset) -> Result<EpochStats> {
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);

        let start = Instant::now();
        let mut loss_sum = 0.0;
        let mut steps = 0;
        let mut lr = self.config.learning_rate;
        for chunk in order.chunks(self.config.train_batch_size) {
            lr = learning_rate_at(
                self.step,
                self.config.warmup_steps,
                self.total_steps,
                self.config.learning_rate,
            );
            self.decayed.set_learning_rate(lr);
            self.undecayed.set_learning_rate(lr);

            let (input_ids, attention_mask, labels) = self.batch(train, chunk)?;
            let logits = self.logits(&input_ids, &attention_mask, true)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
            let grads = loss
                .backward()
                .with_context(|| format!("Backward pass at step {} failed", self.step))?;
            self.decayed
                .step(&grads)
                .and_then(|_| self.undecayed.step(&grads))
                .with_context(|| format!("Optimizer step {} failed", self.step))?;

            loss_sum += loss.to_scalar::<f32>()? as f64;
            self.step += 1;
            steps += 1;
            if steps % 50 == 0 {
                debug!(
                    "Epoch {} step {}: loss={:.4} ({:.2?} elapsed)",
                    epoch,
                    steps,
                    loss_sum / steps as f64,
                    start.elapsed()
                );
            }
        }

        Ok(EpochStats {
            train_loss: loss_sum / steps.max(1) as f64,
            learning_rate: lr,
            steps,
        })
    }

    fn evaluate(&self, data: &TokenizedDataset) -> Result<EvalMetrics> {
        if data.is_empty() {
            bail!("Cannot evaluate on an empty dataset");
        }
        let order: Vec<usize> = (0..data.len()).collect();
        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        for chunk in order.chunks(self.config.eval_batch_size) {
            let (input_ids, attention_mask, labels) = self.batch(data, chunk)?;
            let logits = self.logits(&input_ids, &attention_mask, false)?.detach();
            let loss = candle_nn::loss::cross_entropy(&logits, &labels)?.to_scalar::<f32>()?;
            loss_sum += loss as f64 * chunk.len() as f64;

            let predictions = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
            let truth = labels.to_vec1::<u32>()?;
            correct += predictions
                .iter()
                .zip(&truth)
                .filter(|(p, t)| p == t)
                .count();
        }
        Ok(EvalMetrics {
            loss: loss_sum / data.len() as f64,
            accuracy: correct as f64 / data.len() as f64,
        })
    }

    fn save_checkpoint(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;
        self.varmap
            .save(dir.join(WEIGHTS_FILE))
            .with_context(|| format!("Failed to save checkpoint to {}", dir.display()))
    }

    fn restore_checkpoint(&mut self, dir: &Path) -> Result<()> {
        self.varmap
            .load(dir.join(WEIGHTS_FILE))
            .with_context(|| format!("Failed to load checkpoint from {}", dir.display()))
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        self.varmap
            .save(dir.join(WEIGHTS_FILE))
            .context("Failed to save model weights")?;
        let config = classification_config(&self.base_config, &self.labels);
        fs::write(
            dir.join(MODEL_CONFIG_FILE),
            serde_json::to_vec_pretty(&config)?,
        )
        .context("Failed to write model config")?;
        Ok(())
    }

    fn accelerated(&self) -> bool {
        !self.device.is_cpu()
    }
}

/// The base model config with the classification head and label maps wired in.
pub fn classification_config(base: &Value, labels: &LabelMapping) -> Value {
    let mut config = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    config.insert("architectures".into(), json!([SEQUENCE_CLASSIFICATION_ARCH]));
    config.insert("num_labels".into(), json!(labels.num_labels));
    config.insert("id2label".into(), json!(labels.id2label));
    config.insert("label2id".into(), json!(labels.label2id));
    config.insert("problem_type".into(), json!("single_label_classification"));
    Value::Object(config)
}

/// Biases and LayerNorm parameters are not weight-decayed.
pub fn exempt_from_decay(name: &str) -> bool {
    name.ends_with(".bias") || name.contains("LayerNorm")
}

/// Splits the trainable variables into (decayed, exempt) groups.
fn parameter_groups(varmap: &VarMap) -> Result<(Vec<Var>, Vec<Var>)> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("Variable map lock poisoned"))?;
    let (exempt, decayed): (Vec<_>, Vec<_>) = vars
        .iter()
        .partition(|(name, _)| exempt_from_decay(name));
    Ok((
        decayed.into_iter().map(|(_, var)| var.clone()).collect(),
        exempt.into_iter().map(|(_, var)| var.clone()).collect(),
    ))
}

/// Checkpoint names under which a variable may be stored.
///
/// Base checkpoints are saved either with or without the `bert.` prefix, and
/// older ones use `gamma`/`beta` for layer norms.
pub fn candidate_names(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if let Some(stripped) = name.strip_prefix("bert.") {
        names.push(stripped.to_string());
    }
    for candidate in names.clone() {
        if let Some(prefix) = candidate.strip_suffix(".LayerNorm.weight") {
            names.push(format!("{}.LayerNorm.gamma", prefix));
        }
        if let Some(prefix) = candidate.strip_suffix(".LayerNorm.bias") {
            names.push(format!("{}.LayerNorm.beta", prefix));
        }
    }
    names
}

fn load_pretrained(varmap: &VarMap, weights: &HashMap<String, Tensor>) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("Variable map lock poisoned"))?;

    let mut loaded = 0;
    let mut missing = Vec::new();
    for (name, var) in vars.iter() {
        if name.starts_with("classifier.") {
            continue;
        }
        match candidate_names(name).iter().find_map(|c| weights.get(c)) {
            Some(tensor) => {
                let tensor = tensor.to_dtype(DType::F32)?.to_device(var.device())?;
                var.set(&tensor)
                    .with_context(|| format!("Pretrained tensor {} has the wrong shape", name))?;
                loaded += 1;
            }
            None => missing.push(name.clone()),
        }
    }

    let (pooler, encoder): (Vec<String>, Vec<String>) = missing
        .into_iter()
        .partition(|name| name.starts_with("bert.pooler."));
    if let Some(first) = encoder.first() {
        bail!(
            "{} encoder tensors missing from base weights (first: {})",
            encoder.len(),
            first
        );
    }
    if !pooler.is_empty() {
        warn!("Base weights have no pooler, it will be trained from scratch");
    }
    info!("Loaded {} pretrained tensors", loaded);
    Ok(())
}
