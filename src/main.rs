// src/main.rs

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use std::time::Instant;

use feedback_finetune_lib::{
    Pipeline, PipelineOutcome,
    cli::Cli,
    config,
    curation::{FeedbackStore, PgFeedbackStore},
    db,
    publisher::{HfHubRegistry, PublishOutcome},
    training::hub::HubModelProvider,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    info!("Starting feedback fine-tuning pipeline");
    let start_time = Instant::now();

    config::load_env_files();
    let cli = Cli::parse();
    let config = cli.into_config(config::registry_token_from_env());

    if config.mode.publishes() && config.registry_token.is_none() {
        warn!("HUGGINGFACE_API_KEY is not set, the upload step will be skipped");
    }
    let registry = config
        .registry_token
        .clone()
        .map(|token| HfHubRegistry::new(&config.registry_endpoint, token))
        .transpose()
        .context("Failed to set up the model registry client")?;
    let provider = HubModelProvider::new(config.registry_token.clone(), config.force_cpu);

    let replaying = config.from_snapshot.is_some();
    let pipeline = Pipeline::new(config, provider, registry)?;

    // Credentials are checked before any stage runs.
    let store = if replaying {
        None
    } else {
        let pg_config = db::build_pg_config()?;
        let pool = db::connect(pg_config)
            .await
            .context("Failed to connect to database")?;
        info!("Successfully connected to the database");
        Some(PgFeedbackStore::new(pool))
    };

    let outcome = pipeline
        .run(store.as_ref().map(|s| s as &dyn FeedbackStore), Utc::now())
        .await?;
    report(&outcome);

    info!("Done in {:.2?}", start_time.elapsed());
    Ok(())
}

fn report(outcome: &PipelineOutcome) {
    match outcome {
        PipelineOutcome::NoEligibleFeedback { cutoff } => {
            warn!("No eligible feedback since {}, nothing to do", cutoff.to_rfc3339());
        }
        PipelineOutcome::Exported { snapshot, examples } => {
            info!(
                "Exported {} examples to {}. Use --train to train the model.",
                examples,
                snapshot.display()
            );
        }
        PipelineOutcome::InsufficientExamples {
            count,
            minimum,
            snapshot,
        } => {
            warn!(
                "Training skipped: {} usable examples, {} required",
                count, minimum
            );
            if let Some(path) = snapshot {
                info!("Snapshot kept at {}", path.display());
            }
        }
        PipelineOutcome::Trained {
            unknown_labels,
            report,
            publish,
            ..
        } => {
            if !unknown_labels.is_empty() {
                warn!("Rows with unknown labels were dropped: {:?}", unknown_labels);
            }
            info!(
                "Model saved to {} (best epoch {}, eval_loss {:.4})",
                report.artifact_dir.display(),
                report.run.best_epoch,
                report.run.eval_loss
            );
            match publish {
                Some(PublishOutcome::Published {
                    repo_id,
                    commit_url,
                    ..
                }) => info!(
                    "Model available at {} ({})",
                    repo_id,
                    commit_url.as_deref().unwrap_or("no commit url")
                ),
                Some(PublishOutcome::Skipped) => warn!("Upload skipped"),
                None => {}
            }
        }
    }
}
