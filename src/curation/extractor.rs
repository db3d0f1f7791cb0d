// src/curation/extractor.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::Instant;

use crate::curation::snapshot;
use crate::db::PgPool;
use crate::error::PipelineError;
use crate::models::{ExtractionSummary, FeedbackRecord, InteractionLog, RawExample};

/// Read access to rated interactions.
///
/// Implementations return every feedback row with `created_at >= cutoff` and
/// `rating >= min_rating`, with the originating interaction log embedded in
/// the same request. A missing log is `interaction: None`, not an error.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn fetch_rated_interactions(
        &self,
        cutoff: DateTime<Utc>,
        min_rating: i32,
    ) -> Result<Vec<FeedbackRecord>>;
}

/// `FeedbackStore` over the production PostgreSQL tables.
pub struct PgFeedbackStore {
    pool: PgPool,
}

impl PgFeedbackStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedbackStore for PgFeedbackStore {
    async fn fetch_rated_interactions(
        &self,
        cutoff: DateTime<Utc>,
        min_rating: i32,
    ) -> Result<Vec<FeedbackRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection for feedback extraction")?;

        // LEFT JOIN: feedback whose log is gone still comes back and is counted
        let rows = client
            .query(
                "SELECT f.id::text AS id,
                        f.rating::int4 AS rating,
                        f.created_at::timestamptz AS created_at,
                        (l.id IS NOT NULL) AS has_log,
                        l.user_message,
                        l.sentiment_emotion::text AS sentiment_emotion,
                        l.sentiment_intensity::float8 AS sentiment_intensity
                 FROM ai_feedback f
                 LEFT JOIN ai_response_logs l ON l.id = f.log_id
                 WHERE f.created_at >= $1::timestamptz
                   AND f.rating >= $2::int4
                 ORDER BY f.created_at ASC, f.id ASC",
                &[&cutoff, &min_rating],
            )
            .await
            .context("Failed to fetch rated feedback from ai_feedback")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let has_log: bool = row.try_get("has_log")?;
            let interaction = if has_log {
                Some(InteractionLog {
                    user_message: row.try_get("user_message")?,
                    predicted_emotion: row.try_get("sentiment_emotion")?,
                    predicted_intensity: row.try_get("sentiment_intensity")?,
                })
            } else {
                None
            };
            records.push(FeedbackRecord {
                id: row.try_get("id")?,
                rating: row.try_get("rating")?,
                created_at: row.try_get("created_at")?,
                interaction,
            });
        }
        debug!("Fetched {} rated feedback rows", records.len());
        Ok(records)
    }
}

/// Output of the extraction stage.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub cutoff: DateTime<Utc>,
    pub examples: Vec<RawExample>,
    pub summary: ExtractionSummary,
    /// `None` when nothing qualified and no snapshot was written.
    pub snapshot: Option<PathBuf>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Harvests rated interactions inside the retention window.
pub struct RecordExtractor {
    data_dir: PathBuf,
    retention_days: i64,
    min_rating: i32,
}

impl RecordExtractor {
    pub fn new(data_dir: impl Into<PathBuf>, retention_days: i64, min_rating: i32) -> Self {
        Self {
            data_dir: data_dir.into(),
            retention_days,
            min_rating,
        }
    }

    /// Start of the retention window, or a configuration error when the
    /// window reaches past the representable date range.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, PipelineError> {
        Duration::try_days(self.retention_days)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "retention window of {} days is out of range",
                    self.retention_days
                ))
            })
    }

    /// Rejects windows and thresholds no store query could satisfy.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.retention_days < 0 {
            return Err(PipelineError::Config(format!(
                "retention window must be non-negative, got {} days",
                self.retention_days
            )));
        }
        if !(1..=5).contains(&self.min_rating) {
            return Err(PipelineError::Config(format!(
                "minimum rating must be within 1..=5, got {}",
                self.min_rating
            )));
        }
        self.cutoff(Utc::now())?;
        Ok(())
    }

    /// Runs the extraction stage.
    ///
    /// Queries the store once, keeps complete joins and writes the survivors
    /// to a timestamped snapshot before returning them. Nothing qualifying is
    /// an empty `Extraction`, not an error, and writes no snapshot.
    ///
    /// # Arguments
    /// * `store` - Feedback store to query
    /// * `now` - Reference time for the retention window and snapshot name
    pub async fn extract<S: FeedbackStore + ?Sized>(
        &self,
        store: &S,
        now: DateTime<Utc>,
    ) -> Result<Extraction, PipelineError> {
        self.validate()?;
        let start = Instant::now();
        let cutoff = self.cutoff(now)?;
        info!(
            "Exporting feedback from the last {} days (since {}) with rating >= {}",
            self.retention_days,
            cutoff.to_rfc3339(),
            self.min_rating
        );

        let records = store
            .fetch_rated_interactions(cutoff, self.min_rating)
            .await
            .map_err(PipelineError::Extraction)?;

        let (examples, summary) = collect_eligible(records);
        log_summary(&summary);

        if examples.is_empty() {
            warn!("No eligible feedback found in the retention window");
            return Ok(Extraction {
                cutoff,
                examples,
                summary,
                snapshot: None,
            });
        }

        let snapshot = snapshot::write_snapshot(&self.data_dir, &examples, now)
            .map_err(PipelineError::Snapshot)?;
        info!(
            "Extraction finished in {:.2?}: {} examples",
            start.elapsed(),
            examples.len()
        );

        Ok(Extraction {
            cutoff,
            examples,
            summary,
            snapshot: Some(snapshot),
        })
    }
}

/// Keeps complete joins and counts the rest by reason.
///
/// A record is kept when its log exists and both `user_message` and
/// `predicted_emotion` are present and non-empty. Pure: no I/O.
pub fn collect_eligible(records: Vec<FeedbackRecord>) -> (Vec<RawExample>, ExtractionSummary) {
    let mut summary = ExtractionSummary {
        fetched: records.len(),
        ..Default::default()
    };
    let mut examples = Vec::with_capacity(records.len());

    for record in records {
        let Some(log) = record.interaction else {
            summary.dropped_missing_log += 1;
            continue;
        };
        let Some(text) = log.user_message.filter(|m| !m.is_empty()) else {
            summary.dropped_missing_message += 1;
            continue;
        };
        let Some(label) = log.predicted_emotion.filter(|e| !e.is_empty()) else {
            summary.dropped_missing_emotion += 1;
            continue;
        };

        *summary.label_distribution.entry(label.clone()).or_insert(0) += 1;
        examples.push(RawExample {
            text,
            label,
            intensity: log.predicted_intensity,
            rating: record.rating,
            feedback_date: record.created_at,
        });
    }

    summary.kept = examples.len();
    (examples, summary)
}

pub(crate) fn log_summary(summary: &ExtractionSummary) {
    info!(
        "Fetched {} feedback rows, kept {}",
        summary.fetched, summary.kept
    );
    if summary.dropped() > 0 {
        warn!(
            "Dropped {} incomplete rows (missing log: {}, missing message: {}, missing emotion: {})",
            summary.dropped(),
            summary.dropped_missing_log,
            summary.dropped_missing_message,
            summary.dropped_missing_emotion
        );
    }
    for (label, count) in &summary.label_distribution {
        info!("  {}: {}", label, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn record(id: &str, rating: i32, days_ago: i64, interaction: Option<InteractionLog>) -> FeedbackRecord {
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        FeedbackRecord {
            id: id.to_string(),
            rating,
            created_at: now - Duration::days(days_ago),
            interaction,
        }
    }

    fn interaction(message: Option<&str>, emotion: Option<&str>) -> Option<InteractionLog> {
        Some(InteractionLog {
            user_message: message.map(str::to_string),
            predicted_emotion: emotion.map(str::to_string),
            predicted_intensity: Some(0.5),
        })
    }

    /// Store that applies the query filters in memory and records its calls.
    struct FilteringStore {
        records: Vec<FeedbackRecord>,
        calls: Mutex<Vec<(DateTime<Utc>, i32)>>,
    }

    #[async_trait]
    impl FeedbackStore for FilteringStore {
        async fn fetch_rated_interactions(
            &self,
            cutoff: DateTime<Utc>,
            min_rating: i32,
        ) -> Result<Vec<FeedbackRecord>> {
            self.calls.lock().unwrap().push((cutoff, min_rating));
            Ok(self
                .records
                .iter()
                .filter(|r| r.created_at >= cutoff && r.rating >= min_rating)
                .cloned()
                .collect())
        }
    }

    #[test]
    fn test_collect_eligible_drops_incomplete_joins() {
        let records = vec![
            record("1", 5, 1, interaction(Some("socorro"), Some("desesperada"))),
            record("2", 5, 1, None),
            record("3", 4, 1, interaction(None, Some("triste"))),
            record("4", 4, 1, interaction(Some("ok"), None)),
            record("5", 4, 1, interaction(Some(""), Some("triste"))),
            record("6", 4, 1, interaction(Some("nao sei"), Some("confusa"))),
        ];

        let (examples, summary) = collect_eligible(records);

        assert_eq!(examples.len(), 2);
        assert_eq!(summary.fetched, 6);
        assert_eq!(summary.kept, 2);
        assert_eq!(summary.dropped_missing_log, 1);
        assert_eq!(summary.dropped_missing_message, 2);
        assert_eq!(summary.dropped_missing_emotion, 1);
        assert_eq!(summary.label_distribution.get("confusa"), Some(&1));
    }

    #[test]
    fn test_unknown_labels_survive_extraction() {
        // Vocabulary validation belongs to the curator
        let (examples, _) = collect_eligible(vec![record("1", 5, 0, interaction(Some("hm"), Some("neutra")))]);
        assert_eq!(examples[0].label, "neutra");
    }

    #[tokio::test]
    async fn test_extract_uses_cutoff_and_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        let store = FilteringStore {
            records: vec![
                record("recent", 5, 10, interaction(Some("feliz hoje"), Some("feliz"))),
                record("old", 5, 120, interaction(Some("antigo"), Some("triste"))),
                record("low", 2, 1, interaction(Some("ruim"), Some("raiva"))),
            ],
            calls: Mutex::new(Vec::new()),
        };

        let extractor = RecordExtractor::new(dir.path(), 90, 4);
        let extraction = extractor.extract(&store, now).await.unwrap();

        assert_eq!(extraction.examples.len(), 1);
        assert_eq!(extraction.examples[0].text, "feliz hoje");
        assert_eq!(extraction.cutoff, now - Duration::days(90));
        assert_eq!(store.calls.lock().unwrap().as_slice(), &[(now - Duration::days(90), 4)]);

        let snapshot = extraction.snapshot.expect("snapshot written");
        assert!(snapshot.exists());
        assert_eq!(snapshot::read_snapshot(&snapshot).unwrap(), extraction.examples);
    }

    #[tokio::test]
    async fn test_empty_extraction_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilteringStore {
            records: vec![record("nolog", 5, 1, None)],
            calls: Mutex::new(Vec::new()),
        };

        let extraction = RecordExtractor::new(dir.path(), 90, 4)
            .extract(&store, Utc::now())
            .await
            .unwrap();

        assert!(extraction.is_empty());
        assert!(extraction.snapshot.is_none());
        assert_eq!(extraction.summary.dropped_missing_log, 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_rating_threshold_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilteringStore {
            records: Vec::new(),
            calls: Mutex::new(Vec::new()),
        };
        let err = RecordExtractor::new(dir.path(), 90, 6)
            .extract(&store, Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_window_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilteringStore {
            records: Vec::new(),
            calls: Mutex::new(Vec::new()),
        };

        for days in [1_000_000_000, i64::MAX] {
            let extractor = RecordExtractor::new(dir.path(), days, 4);
            assert!(extractor.validate().unwrap_err().is_configuration());
            let err = extractor.extract(&store, Utc::now()).await.unwrap_err();
            assert!(err.is_configuration());
        }
        assert!(store.calls.lock().unwrap().is_empty());
        assert!(RecordExtractor::new(dir.path(), 36_500, 4).validate().is_ok());
    }
}
