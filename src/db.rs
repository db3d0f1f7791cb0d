// src/db.rs

use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

use crate::error::PipelineError;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Builds a PostgreSQL config from the environment.
///
/// `DATABASE_URL` wins when set. Otherwise the `POSTGRES_*` variables are
/// read; the password has no default because the feedback tables are only
/// readable with service credentials.
pub fn build_pg_config() -> Result<Config, PipelineError> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let config = url
            .parse::<Config>()
            .map_err(|e| PipelineError::Config(format!("DATABASE_URL is not valid: {}", e)))?;
        info!("DB Config: using DATABASE_URL");
        return Ok(with_session_settings(config));
    }

    let password = std::env::var("POSTGRES_PASSWORD")
        .map_err(|_| PipelineError::MissingEnv("POSTGRES_PASSWORD (or DATABASE_URL)".into()))?;
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port_str = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| PipelineError::Config(format!("POSTGRES_PORT is not a port: {}", port_str)))?;
    let dbname = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "postgres".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());

    info!(
        "DB Config: Host={}, Port={}, DB={}, User={}",
        host, port, dbname, user
    );
    let mut config = Config::new();
    config
        .host(&host)
        .port(port)
        .dbname(&dbname)
        .user(&user)
        .password(&password);
    Ok(with_session_settings(config))
}

fn with_session_settings(mut config: Config) -> Config {
    config.application_name("feedback_finetune");
    config.connect_timeout(Duration::from_secs(10));
    config
}

/// Initializes the connection pool and checks it with a test query.
///
/// Extraction issues a single query per run, so the pool stays small.
pub async fn connect(config: Config) -> Result<PgPool> {
    info!("Connecting to PostgreSQL database...");
    let manager = PostgresConnectionManager::new(config, NoTls);

    let pool = Pool::builder()
        .max_size(2)
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    let conn = pool
        .get()
        .await
        .context("Failed to get test connection from pool")?;
    conn.query_one("SELECT 1", &[])
        .await
        .context("Test query 'SELECT 1' failed")?;
    drop(conn);
    info!("Database connection pool initialized successfully.");
    Ok(pool)
}
