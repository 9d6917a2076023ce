//! SQLite result sink for the replay daemon.
//!
//! Append-only persistence for completed test cases. One writer (the
//! execution controller), any number of readers (status and export paths).
//! WAL mode lets readers observe appended rows without blocking the writer
//! and without torn reads.

use chrono::{DateTime, TimeZone, Utc};
use replay_core::{ExtraInputs, FinalStatus, Id, ResultRecord};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::path::Path;
use thiserror::Error;

/// Explicit column list so row mapping is independent of column order.
const RESULT_COLUMNS: &str = "run_id, group_id, turn_number, user_message, expected_reply, \
    extra_inputs_json, actual_reply, latency_seconds, final_status, error_detail, completed_at";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Which records an export should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    /// Every record ever written.
    All,
    /// Records belonging to one run.
    Run(Id),
}

/// Durable, append-only store of result records.
pub struct Sink {
    pool: Pool<Sqlite>,
}

impl Sink {
    /// Open (or create) the sink database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // WAL mode: readers never block the single writer, appends are
        // atomic at the record level.
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations to initialize the schema.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            // Idempotent re-runs: ignore already-applied DDL.
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Durably append one result record.
    ///
    /// Once this returns Ok, the record survives a process crash. There is
    /// no update or delete path for written records.
    pub async fn append(&self, record: &ResultRecord) -> Result<()> {
        let extra_inputs_json = match &record.extra_inputs {
            Some(map) => Some(serde_json::to_string(map)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO results (run_id, group_id, turn_number, user_message, expected_reply,
                                 extra_inputs_json, actual_reply, latency_seconds, final_status,
                                 error_detail, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(record.run_id.as_ref())
        .bind(&record.group_id)
        .bind(i64::from(record.turn_number))
        .bind(&record.user_message)
        .bind(&record.expected_reply)
        .bind(extra_inputs_json)
        .bind(&record.actual_reply)
        .bind(record.latency_seconds)
        .bind(record.final_status.as_str())
        .bind(&record.error_detail)
        .bind(record.completed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List records in insertion order, scoped to all runs or one run.
    pub async fn list(&self, scope: &ExportScope) -> Result<Vec<ResultRecord>> {
        let rows = match scope {
            ExportScope::All => {
                let query = format!("SELECT {RESULT_COLUMNS} FROM results ORDER BY seq ASC");
                sqlx::query(&query).fetch_all(&self.pool).await?
            }
            ExportScope::Run(run_id) => {
                let query = format!(
                    "SELECT {RESULT_COLUMNS} FROM results WHERE run_id = ?1 ORDER BY seq ASC"
                );
                sqlx::query(&query)
                    .bind(run_id.as_ref())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_record).collect()
    }

    /// Count records in scope.
    pub async fn count(&self, scope: &ExportScope) -> Result<usize> {
        let count: (i64,) = match scope {
            ExportScope::All => {
                sqlx::query_as("SELECT COUNT(*) FROM results")
                    .fetch_one(&self.pool)
                    .await?
            }
            ExportScope::Run(run_id) => {
                sqlx::query_as("SELECT COUNT(*) FROM results WHERE run_id = ?1")
                    .bind(run_id.as_ref())
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count.0 as usize)
    }

    /// Run id of the most recently written record, if any.
    pub async fn latest_run_id(&self) -> Result<Option<Id>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT run_id FROM results ORDER BY seq DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| Id::from_string(id)))
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ResultRecord> {
    let final_status_raw: String = row.get("final_status");
    let final_status = FinalStatus::parse(&final_status_raw)
        .ok_or_else(|| SinkError::Corrupt(format!("unknown final_status: {final_status_raw}")))?;

    let extra_inputs_json: Option<String> = row.get("extra_inputs_json");
    let extra_inputs: Option<ExtraInputs> = match extra_inputs_json {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    let completed_at_ms: i64 = row.get("completed_at");
    let completed_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(completed_at_ms)
        .single()
        .ok_or_else(|| SinkError::Corrupt(format!("bad completed_at: {completed_at_ms}")))?;

    Ok(ResultRecord {
        run_id: Id::from_string(row.get::<String, _>("run_id")),
        group_id: row.get("group_id"),
        turn_number: row.get::<i64, _>("turn_number") as u32,
        user_message: row.get("user_message"),
        expected_reply: row.get("expected_reply"),
        extra_inputs,
        actual_reply: row.get("actual_reply"),
        latency_seconds: row.get("latency_seconds"),
        final_status,
        error_detail: row.get("error_detail"),
        completed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_sink() -> (Sink, TempDir) {
        let dir = TempDir::new().unwrap();
        let sink = Sink::new(&dir.path().join("test.db")).await.unwrap();
        sink.migrate_embedded().await.unwrap();
        (sink, dir)
    }

    fn record(run: &str, group: &str, turn: u32, status: FinalStatus) -> ResultRecord {
        ResultRecord {
            run_id: Id::from_string(run),
            group_id: group.to_string(),
            turn_number: turn,
            user_message: format!("message {turn}"),
            expected_reply: None,
            extra_inputs: None,
            actual_reply: "reply".to_string(),
            latency_seconds: 0.5,
            final_status: status,
            error_detail: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_list_round_trips() {
        let (sink, _dir) = create_test_sink().await;

        let mut original = record("run-1", "g1", 1, FinalStatus::Success);
        original.expected_reply = Some("expected".to_string());
        original.extra_inputs = Some(
            serde_json::from_str::<ExtraInputs>(r#"{"lang": "en"}"#).unwrap(),
        );
        original.error_detail = Some("detail".to_string());
        sink.append(&original).await.unwrap();

        let listed = sink.list(&ExportScope::All).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].group_id, original.group_id);
        assert_eq!(listed[0].final_status, original.final_status);
        assert_eq!(listed[0].actual_reply, original.actual_reply);
        assert_eq!(listed[0].extra_inputs, original.extra_inputs);
        assert_eq!(listed[0].error_detail, original.error_detail);
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let (sink, _dir) = create_test_sink().await;

        for turn in 1..=3 {
            sink.append(&record("run-1", "g1", turn, FinalStatus::Success))
                .await
                .unwrap();
        }
        sink.append(&record("run-1", "g2", 1, FinalStatus::Failed))
            .await
            .unwrap();

        let listed = sink.list(&ExportScope::All).await.unwrap();
        let order: Vec<(String, u32)> = listed
            .iter()
            .map(|r| (r.group_id.clone(), r.turn_number))
            .collect();
        assert_eq!(
            order,
            vec![
                ("g1".to_string(), 1),
                ("g1".to_string(), 2),
                ("g1".to_string(), 3),
                ("g2".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn run_scope_filters_records() {
        let (sink, _dir) = create_test_sink().await;

        sink.append(&record("run-1", "g1", 1, FinalStatus::Success))
            .await
            .unwrap();
        sink.append(&record("run-2", "g1", 1, FinalStatus::Success))
            .await
            .unwrap();

        let scoped = sink
            .list(&ExportScope::Run(Id::from_string("run-2")))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].run_id.as_ref(), "run-2");

        assert_eq!(sink.count(&ExportScope::All).await.unwrap(), 2);
        assert_eq!(
            sink.count(&ExportScope::Run(Id::from_string("run-1")))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn latest_run_id_tracks_last_writer() {
        let (sink, _dir) = create_test_sink().await;
        assert!(sink.latest_run_id().await.unwrap().is_none());

        sink.append(&record("run-1", "g1", 1, FinalStatus::Success))
            .await
            .unwrap();
        sink.append(&record("run-2", "g1", 1, FinalStatus::Success))
            .await
            .unwrap();

        assert_eq!(
            sink.latest_run_id().await.unwrap().unwrap().as_ref(),
            "run-2"
        );
    }

    #[tokio::test]
    async fn reads_tolerate_concurrent_appends() {
        let (sink, _dir) = create_test_sink().await;

        // Interleave appends and reads; every read must see a whole number
        // of intact records.
        for turn in 1..=5 {
            sink.append(&record("run-1", "g1", turn, FinalStatus::Success))
                .await
                .unwrap();
            let listed = sink.list(&ExportScope::All).await.unwrap();
            assert_eq!(listed.len(), turn as usize);
            assert!(listed.iter().all(|r| r.actual_reply == "reply"));
        }
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let (sink, _dir) = create_test_sink().await;
        sink.migrate_embedded().await.unwrap();
        sink.migrate_embedded().await.unwrap();
    }
}
