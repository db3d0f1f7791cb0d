// src/bin/export_training_data.rs
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use feedback_finetune_lib::{
    config::{self, DATA_DIR, DEFAULT_MIN_RATING, DEFAULT_RETENTION_DAYS},
    curation::{PgFeedbackStore, RecordExtractor},
    db,
};

/// Exports rated conversations to a CSV snapshot without training.
#[derive(Debug, Parser)]
#[command(name = "export_training_data")]
struct Args {
    #[arg(long, env = "FEEDBACK_RETENTION_DAYS", default_value_t = DEFAULT_RETENTION_DAYS)]
    days: i64,

    #[arg(long, env = "FEEDBACK_MIN_RATING", default_value_t = DEFAULT_MIN_RATING)]
    min_rating: i32,

    #[arg(long, env = "TRAINING_DATA_DIR", default_value = DATA_DIR)]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    info!("Starting training data export");

    config::load_env_files();
    let args = Args::parse();

    let extractor = RecordExtractor::new(&args.data_dir, args.days, args.min_rating);
    extractor.validate()?;

    let pool = db::connect(db::build_pg_config()?)
        .await
        .context("Failed to connect to database")?;
    let store = PgFeedbackStore::new(pool);

    let extraction = extractor.extract(&store, Utc::now()).await?;
    match &extraction.snapshot {
        Some(path) => info!(
            "Exported {} examples to {}",
            extraction.examples.len(),
            path.display()
        ),
        None => info!("No eligible feedback since {}", extraction.cutoff.to_rfc3339()),
    }

    Ok(())
}
