// src/training/orchestrator.rs

use anyhow::{Context, anyhow};
use chrono::Utc;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::labels;
use crate::training::artifact::{
    ArtifactStaging, EpochRecord, TOKENIZER_FILE, TRAINER_STATE_FILE, TrainerState, TrainingRun,
};
use crate::training::checkpoint::{
    CHECKPOINTS_DIR, CheckpointRecord, CheckpointRetention, EarlyStopping, checkpoint_dir,
    remove_checkpoints,
};
use crate::training::config::TrainingConfig;
use crate::training::engine::{
    ClassifierEngine, EpochStats, EvalMetrics, LabelMapping, ModelProvider,
};
use crate::training::tokenization::TokenizedDataset;

/// Epoch-boundary states of a training run.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingState {
    Running { epoch: usize },
    Evaluating { epoch: usize, stats: EpochStats },
    Checkpointing { epoch: usize, stats: EpochStats, metrics: EvalMetrics },
    StoppedEarly { epoch: usize },
    Completed { epoch: usize },
}

impl TrainingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrainingState::StoppedEarly { .. } | TrainingState::Completed { .. }
        )
    }
}

/// Lowest validation loss seen so far. Ties keep the earlier epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestCheckpoint {
    pub epoch: usize,
    pub eval_loss: f64,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub run: TrainingRun,
    pub artifact_dir: PathBuf,
    pub final_metrics: EvalMetrics,
    pub history: Vec<EpochRecord>,
    pub final_state: TrainingState,
}

/// Fine-tunes a classifier and persists the best checkpoint as the artifact.
pub struct TrainingOrchestrator<P: ModelProvider> {
    provider: P,
    config: TrainingConfig,
    output_dir: PathBuf,
}

impl<P: ModelProvider> TrainingOrchestrator<P> {
    pub fn new(provider: P, config: TrainingConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            config,
            output_dir: output_dir.into(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs the epoch loop and promotes the artifact.
    ///
    /// # Arguments
    /// * `base_model` - Identifier handed to the model provider
    /// * `train` - Tokenized training split
    /// * `validation` - Tokenized validation split
    /// * `tokenizer` - Configured tokenizer saved with the weights
    ///
    /// # Returns
    /// * `Result<TrainingReport, PipelineError>` - Metadata of the persisted artifact
    pub fn train(
        &self,
        base_model: &str,
        train: &TokenizedDataset,
        validation: &TokenizedDataset,
        tokenizer: &Tokenizer,
    ) -> Result<TrainingReport, PipelineError> {
        if train.is_empty() || validation.is_empty() {
            return Err(PipelineError::EmptySplit {
                train: train.len(),
                validation: validation.len(),
            });
        }
        self.config.validate()?;

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        info!(
            "Starting training run {} on {} ({} train / {} validation, {} epochs)",
            run_id,
            base_model,
            train.len(),
            validation.len(),
            self.config.epochs
        );

        let load_start = Instant::now();
        let mapping = LabelMapping::emotions();
        let mut engine = self
            .provider
            .load_classifier(base_model, &mapping, &self.config, train.len())
            .map_err(|source| PipelineError::ModelLoad {
                model_id: base_model.to_string(),
                source,
            })?;
        info!("Classifier ready in {:.2?}", load_start.elapsed());
        if engine.accelerated() {
            info!("Training on a GPU device");
        }

        self.clear_stale_checkpoints()
            .map_err(PipelineError::Artifact)?;

        let mut retention = CheckpointRetention::new(self.config.save_total_limit);
        let mut stopper = EarlyStopping::new(self.config.early_stopping_patience, 0.0);
        let mut best: Option<BestCheckpoint> = None;
        let mut history: Vec<EpochRecord> = Vec::with_capacity(self.config.epochs);

        let mut state = TrainingState::Running { epoch: 1 };
        while !state.is_terminal() {
            state = match state {
                TrainingState::Running { epoch } => {
                    let epoch_start = Instant::now();
                    let stats = engine
                        .train_epoch(epoch, train)
                        .map_err(|source| PipelineError::Training { epoch, source })?;
                    info!(
                        "Epoch {}/{}: train_loss={:.4} lr={:.2e} in {:.2?}",
                        epoch,
                        self.config.epochs,
                        stats.train_loss,
                        stats.learning_rate,
                        epoch_start.elapsed()
                    );
                    TrainingState::Evaluating { epoch, stats }
                }
                TrainingState::Evaluating { epoch, stats } => {
                    let metrics = engine
                        .evaluate(validation)
                        .map_err(|source| PipelineError::Training { epoch, source })?;
                    info!(
                        "Epoch {}/{}: eval_loss={:.4} eval_accuracy={:.4}",
                        epoch, self.config.epochs, metrics.loss, metrics.accuracy
                    );
                    TrainingState::Checkpointing {
                        epoch,
                        stats,
                        metrics,
                    }
                }
                TrainingState::Checkpointing {
                    epoch,
                    stats,
                    metrics,
                } => {
                    let record = CheckpointRecord {
                        epoch,
                        eval_loss: metrics.loss,
                        eval_accuracy: metrics.accuracy,
                        path: checkpoint_dir(&self.output_dir, epoch),
                    };
                    engine
                        .save_checkpoint(&record.path)
                        .map_err(|source| PipelineError::Training { epoch, source })?;
                    record.write_meta().map_err(PipelineError::Artifact)?;

                    let improved = stopper.observe(metrics.loss);
                    if improved {
                        best = Some(BestCheckpoint {
                            epoch,
                            eval_loss: metrics.loss,
                        });
                        debug!("New best checkpoint at epoch {}", epoch);
                    }
                    let evicted = retention.register(record, best.map(|b| b.epoch));
                    remove_checkpoints(&evicted).map_err(PipelineError::Artifact)?;

                    history.push(EpochRecord {
                        epoch,
                        train_loss: stats.train_loss,
                        eval_loss: metrics.loss,
                        eval_accuracy: metrics.accuracy,
                        learning_rate: stats.learning_rate,
                    });

                    if stopper.should_stop() {
                        warn!(
                            "Early stopping at epoch {}: no eval_loss improvement for {} epochs",
                            epoch,
                            stopper.epochs_without_improvement()
                        );
                        TrainingState::StoppedEarly { epoch }
                    } else if epoch >= self.config.epochs {
                        TrainingState::Completed { epoch }
                    } else {
                        TrainingState::Running { epoch: epoch + 1 }
                    }
                }
                terminal => terminal,
            };
        }

        let (epochs_completed, stopped_early) = match &state {
            TrainingState::StoppedEarly { epoch } => (*epoch, true),
            TrainingState::Completed { epoch } => (*epoch, false),
            _ => (history.len(), false),
        };

        // NaN losses never compare as an improvement.
        let best = best.ok_or_else(|| PipelineError::Training {
            epoch: epochs_completed,
            source: anyhow!("no epoch produced a finite eval_loss"),
        })?;
        let best_record = retention.get(best.epoch).cloned().ok_or_else(|| {
            PipelineError::Artifact(anyhow!("best checkpoint {} was evicted", best.epoch))
        })?;

        info!(
            "Restoring best checkpoint from epoch {} (eval_loss={:.4})",
            best.epoch, best.eval_loss
        );
        engine
            .restore_checkpoint(&best_record.path)
            .map_err(|source| PipelineError::Training {
                epoch: best.epoch,
                source,
            })?;
        let final_metrics = engine
            .evaluate(validation)
            .map_err(|source| PipelineError::Training {
                epoch: best.epoch,
                source,
            })?;
        info!(
            "Final eval_loss={:.4} eval_accuracy={:.4}",
            final_metrics.loss, final_metrics.accuracy
        );

        let run = TrainingRun {
            run_id,
            base_model: base_model.to_string(),
            trained_at: Utc::now(),
            num_train_examples: train.len(),
            num_val_examples: validation.len(),
            eval_loss: final_metrics.loss,
            epochs: self.config.epochs,
            emotion_labels: labels::label_names(),
            best_epoch: best.epoch,
            epochs_completed,
            stopped_early,
        };
        let trainer_state = TrainerState {
            log_history: history.clone(),
            best_epoch: best.epoch,
            best_eval_loss: best.eval_loss,
            metric_for_best_model: self.config.metric_for_best_model.clone(),
            stopped_early,
            accelerated: engine.accelerated(),
        };

        let artifact_dir = self
            .persist(&engine, tokenizer, &run, &trainer_state)
            .map_err(PipelineError::Artifact)?;

        info!(
            "Training run {} finished in {:.2?}",
            run_id,
            started.elapsed()
        );
        Ok(TrainingReport {
            run,
            artifact_dir,
            final_metrics,
            history,
            final_state: state,
        })
    }

    fn persist(
        &self,
        engine: &P::Engine,
        tokenizer: &Tokenizer,
        run: &TrainingRun,
        trainer_state: &TrainerState,
    ) -> anyhow::Result<PathBuf> {
        let staging = ArtifactStaging::create(&self.output_dir, run.run_id)?;
        engine
            .save_pretrained(staging.path())
            .context("Failed to save model weights")?;
        let tokenizer_path = staging.path().join(TOKENIZER_FILE);
        tokenizer
            .save(&tokenizer_path, false)
            .map_err(|e| anyhow!("Failed to save tokenizer: {}", e))?;
        staging.write_json(TRAINER_STATE_FILE, trainer_state)?;
        staging.promote(run)
    }

    fn clear_stale_checkpoints(&self) -> anyhow::Result<()> {
        let dir = self.output_dir.join(CHECKPOINTS_DIR);
        if dir.exists() {
            warn!("Removing checkpoints of a previous run in {}", dir.display());
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::artifact::{METADATA_FILE, WEIGHTS_FILE, read_metadata};
    use crate::training::tokenization::TokenizedExample;
    use crate::training::tokenization::test_support::word_tokenizer;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Engine that replays a fixed eval-loss sequence and records weights as
    /// the epoch number that produced them.
    struct ScriptedEngine {
        losses: Vec<f64>,
        current_epoch: usize,
        restored: Rc<RefCell<Option<usize>>>,
        fail_at: Option<usize>,
    }

    impl ClassifierEngine for ScriptedEngine {
        fn train_epoch(&mut self, epoch: usize, _train: &TokenizedDataset) -> anyhow::Result<EpochStats> {
            if self.fail_at == Some(epoch) {
                anyhow::bail!("out of memory");
            }
            self.current_epoch = epoch;
            Ok(EpochStats {
                train_loss: 1.0 / epoch as f64,
                learning_rate: 2e-5,
                steps: 1,
            })
        }

        fn evaluate(&self, _data: &TokenizedDataset) -> anyhow::Result<EvalMetrics> {
            Ok(EvalMetrics {
                loss: self.losses[self.current_epoch - 1],
                accuracy: 0.5,
            })
        }

        fn save_checkpoint(&self, dir: &Path) -> anyhow::Result<()> {
            fs::create_dir_all(dir)?;
            fs::write(dir.join(WEIGHTS_FILE), self.current_epoch.to_string())?;
            Ok(())
        }

        fn restore_checkpoint(&mut self, dir: &Path) -> anyhow::Result<()> {
            let epoch: usize = fs::read_to_string(dir.join(WEIGHTS_FILE))?.parse()?;
            self.current_epoch = epoch;
            *self.restored.borrow_mut() = Some(epoch);
            Ok(())
        }

        fn save_pretrained(&self, dir: &Path) -> anyhow::Result<()> {
            fs::write(dir.join(WEIGHTS_FILE), self.current_epoch.to_string())?;
            Ok(())
        }
    }

    struct ScriptedProvider {
        losses: Vec<f64>,
        loads: RefCell<usize>,
        restored: Rc<RefCell<Option<usize>>>,
        fail_at: Option<usize>,
    }

    impl ScriptedProvider {
        fn new(losses: Vec<f64>) -> Self {
            Self {
                losses,
                loads: RefCell::new(0),
                restored: Rc::new(RefCell::new(None)),
                fail_at: None,
            }
        }
    }

    impl ModelProvider for ScriptedProvider {
        type Engine = ScriptedEngine;

        fn load_tokenizer(&self, _model_id: &str) -> anyhow::Result<Tokenizer> {
            Ok(word_tokenizer())
        }

        fn load_classifier(
            &self,
            _model_id: &str,
            labels: &LabelMapping,
            _config: &TrainingConfig,
            _num_train_examples: usize,
        ) -> anyhow::Result<ScriptedEngine> {
            assert_eq!(labels.num_labels, 7);
            *self.loads.borrow_mut() += 1;
            Ok(ScriptedEngine {
                losses: self.losses.clone(),
                current_epoch: 0,
                restored: self.restored.clone(),
                fail_at: self.fail_at,
            })
        }
    }

    fn dataset(n: usize) -> TokenizedDataset {
        TokenizedDataset {
            examples: (0..n)
                .map(|i| TokenizedExample {
                    input_ids: vec![2, 3, 0, 0],
                    attention_mask: vec![1, 1, 0, 0],
                    labels: (i % 7) as u32,
                })
                .collect(),
            max_length: 4,
            truncated: 0,
        }
    }

    fn run_with(
        provider: ScriptedProvider,
        epochs: usize,
        output: &Path,
    ) -> (Result<TrainingReport, PipelineError>, ScriptedProvider) {
        let orchestrator = TrainingOrchestrator::new(
            provider,
            TrainingConfig::default().with_epochs(epochs),
            output,
        );
        let result = orchestrator.train("base", &dataset(14), &dataset(7), &word_tokenizer());
        (result, orchestrator.provider)
    }

    #[test]
    fn test_improving_run_keeps_last_epoch() {
        let output = tempfile::tempdir().unwrap();
        let (result, provider) =
            run_with(ScriptedProvider::new(vec![0.9, 0.7, 0.5]), 3, output.path());
        let report = result.unwrap();

        assert_eq!(report.run.best_epoch, 3);
        assert_eq!(report.run.epochs, 3);
        assert!(!report.run.stopped_early);
        assert_eq!(report.final_state, TrainingState::Completed { epoch: 3 });
        assert_eq!(*provider.restored.borrow(), Some(3));
        assert_eq!(
            fs::read_to_string(output.path().join(WEIGHTS_FILE)).unwrap(),
            "3"
        );
        assert!(output.path().join(TOKENIZER_FILE).is_file());
        assert_eq!(read_metadata(output.path()).unwrap().eval_loss, 0.5);

        let state: serde_json::Value =
            serde_json::from_slice(&fs::read(output.path().join(TRAINER_STATE_FILE)).unwrap())
                .unwrap();
        assert_eq!(state["accelerated"], false);
        assert!(state.get("mixed_precision").is_none());
    }

    #[test]
    fn test_early_stop_restores_first_minimum() {
        let output = tempfile::tempdir().unwrap();
        let (result, _) = run_with(
            ScriptedProvider::new(vec![0.5, 0.6, 0.7, 0.4, 0.3]),
            5,
            output.path(),
        );
        let report = result.unwrap();

        assert_eq!(report.final_state, TrainingState::StoppedEarly { epoch: 3 });
        assert_eq!(report.run.best_epoch, 1);
        assert_eq!(report.run.epochs_completed, 3);
        assert!(report.run.stopped_early);
        assert_eq!(report.history.len(), 3);
        assert_eq!(
            fs::read_to_string(output.path().join(WEIGHTS_FILE)).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_tie_keeps_earliest_epoch() {
        let output = tempfile::tempdir().unwrap();
        let (result, _) = run_with(ScriptedProvider::new(vec![0.5, 0.5, 0.6]), 3, output.path());
        assert_eq!(result.unwrap().run.best_epoch, 1);
    }

    #[test]
    fn test_retention_keeps_at_most_two_checkpoints() {
        let output = tempfile::tempdir().unwrap();
        let (result, _) = run_with(
            ScriptedProvider::new(vec![0.9, 0.8, 0.7, 0.6]),
            4,
            output.path(),
        );
        result.unwrap();

        let mut remaining: Vec<String> = fs::read_dir(output.path().join(CHECKPOINTS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["checkpoint-epoch-3", "checkpoint-epoch-4"]);
    }

    #[test]
    fn test_empty_split_fails_before_model_load() {
        let output = tempfile::tempdir().unwrap();
        let orchestrator = TrainingOrchestrator::new(
            ScriptedProvider::new(vec![0.5]),
            TrainingConfig::default(),
            output.path(),
        );
        let err = orchestrator
            .train("base", &dataset(10), &TokenizedDataset::default(), &word_tokenizer())
            .unwrap_err();

        assert!(matches!(err, PipelineError::EmptySplit { train: 10, validation: 0 }));
        assert_eq!(*orchestrator.provider().loads.borrow(), 0);
    }

    #[test]
    fn test_engine_failure_is_fatal_and_leaves_no_artifact() {
        let output = tempfile::tempdir().unwrap();
        let mut provider = ScriptedProvider::new(vec![0.9, 0.8, 0.7]);
        provider.fail_at = Some(2);
        let (result, provider) = run_with(provider, 3, output.path());

        match result.unwrap_err() {
            PipelineError::Training { epoch, source } => {
                assert_eq!(epoch, 2);
                assert!(source.to_string().contains("out of memory"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*provider.loads.borrow(), 1);
        assert!(!output.path().join(METADATA_FILE).exists());
        assert!(checkpoint_dir(output.path(), 1).join(WEIGHTS_FILE).is_file());
    }
}
