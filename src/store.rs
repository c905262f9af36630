//! SQLite persistence for engine state.
//!
//! | Table | Contents | Write pattern |
//! |-------|----------|---------------|
//! | `documents` | indexed passages + embedding blob | upsert by id |
//! | `index_state` | snapshot generation | single row |
//! | `experiments` | experiment config JSON + status | upsert by id |
//! | `assignments` | `(session, experiment) → variant` | insert-or-ignore |
//! | `metric_records` | metric history | append-only |
//! | `feedback_events` | provider feedback | append-only |
//!
//! Timestamps are stored as Unix milliseconds.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use fusion_harness_core::embedding::{blob_to_vec, vec_to_blob};
use fusion_harness_core::experiment::{Assignment, Experiment};
use fusion_harness_core::feedback::FeedbackEvent;
use fusion_harness_core::models::{Document, Metadata, MetricRecord};

/// Row counts for `fuse stats`.
#[derive(Debug, Clone, Default)]
pub struct StoreCounts {
    pub documents: i64,
    pub generation: i64,
    pub experiments: i64,
    pub assignments: i64,
    pub metric_records: i64,
    pub feedback_events: i64,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Index ============

    /// Persist documents and the generation they were published under, in
    /// one transaction.
    pub async fn save_documents(&self, docs: &[Arc<Document>], generation: u64) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            let metadata_json = serde_json::to_string(&doc.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO documents (id, text, embedding, metadata_json, indexed_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    embedding = excluded.embedding,
                    metadata_json = excluded.metadata_json,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(doc.id.as_str())
            .bind(&doc.text_chunk)
            .bind(vec_to_blob(&doc.embedding))
            .bind(metadata_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO index_state (id, generation) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET generation = excluded.generation
            "#,
        )
        .bind(generation as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Stored generation and documents, ordered by id.
    pub async fn load_index(&self) -> Result<(u64, Vec<Document>)> {
        let generation: Option<i64> =
            sqlx::query_scalar("SELECT generation FROM index_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        let rows = sqlx::query("SELECT text, embedding, metadata_json FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.get("text");
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            let metadata: Metadata = serde_json::from_str(&metadata_json)
                .with_context(|| "Corrupt document metadata in database")?;
            docs.push(Document::new(text, blob_to_vec(&blob), metadata));
        }

        Ok((generation.unwrap_or(0).max(0) as u64, docs))
    }

    // ============ Experiments ============

    pub async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        let config_json = serde_json::to_string(experiment)?;
        sqlx::query(
            r#"
            INSERT INTO experiments (id, config_json, status, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                config_json = excluded.config_json,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&experiment.id)
        .bind(config_json)
        .bind(experiment.status.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_experiments(&self) -> Result<Vec<Experiment>> {
        let rows = sqlx::query("SELECT id, config_json FROM experiments ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let json: String = row.get("config_json");
                serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt experiment record: {}", id))
            })
            .collect()
    }

    /// Record an assignment unless the pair already has one.
    pub async fn record_assignment(&self, assignment: &Assignment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO assignments (session_id, experiment_id, variant_id, assigned_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&assignment.session_id)
        .bind(&assignment.experiment_id)
        .bind(&assignment.variant_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `(session_id, experiment_id, variant_id)` triples.
    pub async fn load_assignments(&self) -> Result<Vec<(String, String, String)>> {
        let rows = sqlx::query("SELECT session_id, experiment_id, variant_id FROM assignments")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("session_id"), r.get("experiment_id"), r.get("variant_id")))
            .collect())
    }

    // ============ Metrics & feedback ============

    pub async fn append_metrics(&self, records: &[MetricRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query("INSERT INTO metric_records (ts, name, value, tags_json) VALUES (?, ?, ?, ?)")
                .bind(r.timestamp.timestamp_millis())
                .bind(&r.metric_name)
                .bind(r.value)
                .bind(serde_json::to_string(&r.tags)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_metrics(&self) -> Result<Vec<MetricRecord>> {
        let rows = sqlx::query("SELECT ts, name, value, tags_json FROM metric_records ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let tags_json: String = row.get("tags_json");
            let tags: Metadata = serde_json::from_str(&tags_json)
                .with_context(|| "Corrupt metric tags in database")?;
            let name: String = row.get("name");
            out.push(MetricRecord::new(name, row.get("value"), tags).at(from_millis(row.get("ts"))));
        }
        Ok(out)
    }

    pub async fn append_feedback(&self, event: &FeedbackEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO feedback_events (ts, session_id, provider_id, reward) VALUES (?, ?, ?, ?)",
        )
        .bind(event.timestamp.timestamp_millis())
        .bind(&event.session_id)
        .bind(&event.provider_id)
        .bind(event.reward)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_feedback(&self) -> Result<Vec<FeedbackEvent>> {
        let rows = sqlx::query(
            "SELECT ts, session_id, provider_id, reward FROM feedback_events ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| FeedbackEvent {
                timestamp: from_millis(r.get("ts")),
                session_id: r.get("session_id"),
                provider_id: r.get("provider_id"),
                reward: r.get("reward"),
            })
            .collect())
    }

    async fn count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let generation: Option<i64> =
            sqlx::query_scalar("SELECT generation FROM index_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(StoreCounts {
            documents: self.count("documents").await?,
            generation: generation.unwrap_or(0),
            experiments: self.count("experiments").await?,
            assignments: self.count("assignments").await?,
            metric_records: self.count("metric_records").await?,
            feedback_events: self.count("feedback_events").await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use fusion_harness_core::experiment::{AssignmentSource, ExperimentStatus, Variant};
    use fusion_harness_core::fusion::FusionStrategy;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("fuse.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn test_documents_round_trip_with_generation() {
        let (_tmp, store) = store().await;
        let mut meta = Metadata::new();
        meta.insert("source".into(), "guide.md".into());
        let doc = Arc::new(Document::new("aspirin thins blood", vec![0.5, -0.5], meta.clone()));
        store.save_documents(&[doc.clone()], 3).await.unwrap();
        // re-saving the same id replaces, not duplicates
        store.save_documents(&[doc.clone()], 4).await.unwrap();

        let (generation, docs) = store.load_index().await.unwrap();
        assert_eq!(generation, 4);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, doc.id);
        assert_eq!(docs[0].embedding, vec![0.5, -0.5]);
        assert_eq!(docs[0].metadata, meta);
    }

    #[tokio::test]
    async fn test_empty_index_loads_generation_zero() {
        let (_tmp, store) = store().await;
        let (generation, docs) = store.load_index().await.unwrap();
        assert_eq!(generation, 0);
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_experiment_upsert_keeps_latest_status() {
        let (_tmp, store) = store().await;
        let mut exp = Experiment::new(
            "e1",
            vec![Variant {
                id: "a".into(),
                strategy: FusionStrategy::MajorityVote,
                allocation_weight: 1.0,
                providers: vec![],
            }],
        );
        store.save_experiment(&exp).await.unwrap();
        exp.status = ExperimentStatus::Running;
        store.save_experiment(&exp).await.unwrap();

        let loaded = store.load_experiments().await.unwrap();
        assert_eq!(loaded, vec![exp]);
    }

    #[tokio::test]
    async fn test_first_assignment_wins() {
        let (_tmp, store) = store().await;
        let mk = |variant: &str| Assignment {
            session_id: "s".into(),
            experiment_id: "e".into(),
            variant_id: variant.into(),
            source: AssignmentSource::Hashed,
        };
        store.record_assignment(&mk("a")).await.unwrap();
        store.record_assignment(&mk("b")).await.unwrap();
        assert_eq!(
            store.load_assignments().await.unwrap(),
            vec![("s".to_string(), "e".to_string(), "a".to_string())]
        );
    }

    #[tokio::test]
    async fn test_metrics_and_feedback_append() {
        let (_tmp, store) = store().await;
        let mut tags = Metadata::new();
        tags.insert("variant".into(), "a".into());
        let ts = from_millis(1_700_000_000_123);
        let record = MetricRecord::new("answer_latency_ms", 120.0, tags).at(ts);
        store.append_metrics(&[record.clone(), record.clone()]).await.unwrap();
        store
            .append_feedback(&FeedbackEvent::new("s", "gpt", 0.75))
            .await
            .unwrap();

        let metrics = store.load_metrics().await.unwrap();
        assert_eq!(metrics, vec![record.clone(), record]);
        let feedback = store.load_feedback().await.unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].reward, 0.75);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.metric_records, 2);
        assert_eq!(counts.feedback_events, 1);
    }
}
