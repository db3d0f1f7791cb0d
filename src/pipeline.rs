// src/pipeline.rs

use chrono::{DateTime, Local, Utc};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::{MIN_TRAINING_EXAMPLES, PipelineConfig};
use crate::curation::extractor::{FeedbackStore, RecordExtractor, log_summary};
use crate::curation::{DatasetCurator, snapshot};
use crate::error::PipelineError;
use crate::models::{ExtractionSummary, RawExample};
use crate::publisher::{self, ArtifactPublisher, ModelRegistry, PublishOutcome};
use crate::training::{
    ModelProvider, TokenizationStage, TrainingConfig, TrainingOrchestrator, TrainingReport,
};

/// How a run ended when it did not fail.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Nothing in the retention window qualified. No files were written.
    NoEligibleFeedback { cutoff: DateTime<Utc> },
    /// The snapshot was written and the run mode stops there.
    Exported { snapshot: PathBuf, examples: usize },
    /// Too few usable examples to train. The snapshot stays on disk.
    InsufficientExamples {
        count: usize,
        minimum: usize,
        snapshot: Option<PathBuf>,
    },
    Trained {
        snapshot: Option<PathBuf>,
        unknown_labels: BTreeMap<String, usize>,
        report: Box<TrainingReport>,
        /// `None` when the run mode does not publish.
        publish: Option<PublishOutcome>,
    },
}

/// Rows entering curation and where they were persisted.
struct Acquired {
    rows: Vec<RawExample>,
    snapshot: Option<PathBuf>,
}

/// Extraction, curation, tokenization, training and publishing in order.
pub struct Pipeline<P: ModelProvider, R: ModelRegistry> {
    config: PipelineConfig,
    extractor: RecordExtractor,
    curator: DatasetCurator,
    orchestrator: TrainingOrchestrator<P>,
    publisher: ArtifactPublisher<R>,
}

impl<P: ModelProvider, R: ModelRegistry> Pipeline<P, R> {
    /// Validates the configuration; every error here is raised before any stage runs.
    pub fn new(
        config: PipelineConfig,
        provider: P,
        registry: Option<R>,
    ) -> Result<Self, PipelineError> {
        let extractor =
            RecordExtractor::new(&config.data_dir, config.retention_days, config.min_rating);
        extractor.validate()?;

        let training = TrainingConfig {
            force_cpu: config.force_cpu,
            ..TrainingConfig::default()
        }
        .with_epochs(config.epochs);
        if config.mode.trains() {
            training.validate()?;
        }
        if config.mode.publishes() {
            publisher::validate_repo_id(&config.repo_id)?;
        }
        if let Some(path) = &config.from_snapshot {
            if !path.is_file() {
                return Err(PipelineError::Config(format!(
                    "snapshot {} does not exist",
                    path.display()
                )));
            }
        }

        let orchestrator = TrainingOrchestrator::new(provider, training, &config.output_dir);
        let publisher = ArtifactPublisher::new(registry, config.repo_id.clone());
        Ok(Self {
            config,
            extractor,
            curator: DatasetCurator::default(),
            orchestrator,
            publisher,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the stages the configured mode asks for.
    ///
    /// # Arguments
    /// * `store` - Feedback store; may be `None` only when replaying a snapshot
    /// * `now` - Reference time for the retention window and snapshot name
    ///
    /// # Returns
    /// * `Result<PipelineOutcome, PipelineError>` - Empty inputs are outcomes, not errors
    pub async fn run(
        &self,
        store: Option<&dyn FeedbackStore>,
        now: DateTime<Utc>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let start = Instant::now();
        info!("Pipeline started in {:?} mode", self.config.mode);

        let acquired = match self.acquire(store, now).await? {
            Ok(acquired) => acquired,
            Err(outcome) => return Ok(outcome),
        };

        if !self.config.mode.trains() {
            let examples = acquired.rows.len();
            if examples < MIN_TRAINING_EXAMPLES {
                warn!(
                    "Only {} examples exported, at least {} are recommended for training",
                    examples, MIN_TRAINING_EXAMPLES
                );
            }
            let snapshot = acquired.snapshot.ok_or_else(|| {
                PipelineError::Snapshot(anyhow::anyhow!("extraction produced no snapshot"))
            })?;
            info!("Export finished in {:.2?}", start.elapsed());
            return Ok(PipelineOutcome::Exported { snapshot, examples });
        }

        let validation = self.curator.validate_labels(acquired.rows);
        let count = validation.examples.len();
        if count == 0 || (count < MIN_TRAINING_EXAMPLES && !self.config.allow_small_dataset) {
            warn!(
                "Only {} usable examples, at least {} are needed to train (use --allow-small-dataset to override)",
                count, MIN_TRAINING_EXAMPLES
            );
            return Ok(PipelineOutcome::InsufficientExamples {
                count,
                minimum: MIN_TRAINING_EXAMPLES,
                snapshot: acquired.snapshot,
            });
        }
        if count < MIN_TRAINING_EXAMPLES {
            warn!("Training on a small dataset of {} examples", count);
        }
        let split = self.curator.split(validation.examples)?;

        let tokenizer = self
            .orchestrator
            .provider()
            .load_tokenizer(&self.config.base_model)
            .map_err(|source| PipelineError::ModelLoad {
                model_id: self.config.base_model.clone(),
                source,
            })?;
        let tokenization = TokenizationStage::new(tokenizer);
        let train = tokenization.tokenize("train", split.train)?;
        let validation_set = tokenization.tokenize("validation", split.validation)?;

        let report = self.orchestrator.train(
            &self.config.base_model,
            &train,
            &validation_set,
            tokenization.tokenizer(),
        )?;

        let publish = if self.config.mode.publishes() {
            let message = publisher::commit_message(&Local::now());
            Some(self.publisher.publish(&report.artifact_dir, &message).await?)
        } else {
            None
        };

        info!("Pipeline finished in {:.2?}", start.elapsed());
        Ok(PipelineOutcome::Trained {
            snapshot: acquired.snapshot,
            unknown_labels: validation.unknown_labels,
            report: Box::new(report),
            publish,
        })
    }

    /// Extracts from the store or replays a snapshot.
    ///
    /// The inner `Err` is an early, non-failing outcome.
    async fn acquire(
        &self,
        store: Option<&dyn FeedbackStore>,
        now: DateTime<Utc>,
    ) -> Result<Result<Acquired, PipelineOutcome>, PipelineError> {
        if let Some(path) = &self.config.from_snapshot {
            info!("Replaying snapshot {}", path.display());
            let rows = snapshot::read_snapshot(path).map_err(PipelineError::Snapshot)?;
            log_summary(&ExtractionSummary::from_rows(&rows));
            return Ok(Ok(Acquired {
                rows,
                snapshot: Some(path.clone()),
            }));
        }

        let store = store.ok_or_else(|| {
            PipelineError::Config("no feedback store configured and no snapshot given".into())
        })?;
        let extraction = self.extractor.extract(store, now).await?;
        if extraction.is_empty() {
            return Ok(Err(PipelineOutcome::NoEligibleFeedback {
                cutoff: extraction.cutoff,
            }));
        }
        Ok(Ok(Acquired {
            rows: extraction.examples,
            snapshot: extraction.snapshot,
        }))
    }
}
