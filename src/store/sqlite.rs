//! Durable SQLite-backed store.
//!
//! Maps the store contract onto four tables:
//!
//! - `steps(run_id, step_id, node_id, state_json, created_at)` — cheap
//!   per-step records behind `save_step`/`load_latest`.
//! - `checkpoints(run_id, step_id, payload_json, idempotency_key, created_at)`
//!   — full serialized [`Checkpoint`]s, `(run_id, step_id)` primary key,
//!   unique `idempotency_key`.
//! - `idempotency_keys(key, run_id, step_id, created_at)` — commit
//!   deduplication.
//! - `outbox_events(event_id, run_id, step_id, node_id, kind, payload_json,
//!   created_at, emitted_at)` — the transactional outbox;
//!   `emitted_at IS NULL` marks pending rows.
//!
//! `save_checkpoint` runs as one transaction spanning all inserts, which is
//! the atomicity guarantee; unique-constraint violations on the key or the
//! `(run_id, step_id)` pair surface as
//! [`StoreError::IdempotencyViolation`].

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::marker::PhantomData;
use std::str::FromStr;
use tracing::instrument;

use super::{CheckpointStore, Result, StoreError};
use crate::checkpoint::Checkpoint;
use crate::events::EventRecord;
use crate::types::{NodeId, RunId, StepId};

/// Environment variable consulted by [`SqliteStore::connect_default`].
pub const DATABASE_URL_VAR: &str = "TREADLE_SQLITE_URL";

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS steps (
    run_id     TEXT    NOT NULL,
    step_id    INTEGER NOT NULL,
    node_id    TEXT    NOT NULL,
    state_json TEXT    NOT NULL,
    created_at TEXT    NOT NULL,
    PRIMARY KEY (run_id, step_id)
);
CREATE TABLE IF NOT EXISTS checkpoints (
    run_id          TEXT    NOT NULL,
    step_id         INTEGER NOT NULL,
    payload_json    TEXT    NOT NULL,
    idempotency_key TEXT    NOT NULL UNIQUE,
    created_at      TEXT    NOT NULL,
    PRIMARY KEY (run_id, step_id)
);
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key        TEXT NOT NULL PRIMARY KEY,
    run_id     TEXT NOT NULL,
    step_id    INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS outbox_events (
    event_id     TEXT NOT NULL PRIMARY KEY,
    run_id       TEXT NOT NULL,
    step_id      INTEGER NOT NULL,
    node_id      TEXT,
    kind         TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    emitted_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_outbox_pending
    ON outbox_events (emitted_at, created_at);
";

/// SQLite-backed [`CheckpointStore`].
pub struct SqliteStore<S> {
    pool: SqlitePool,
    _state: PhantomData<fn() -> S>,
}

impl<S> std::fmt::Debug for SqliteStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

impl<S> SqliteStore<S> {
    /// Connect to `database_url` (e.g. `sqlite://treadle.db`), creating the
    /// file and schema when missing.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(map_sqlx)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(map_sqlx)?;
        Ok(Self {
            pool,
            _state: PhantomData,
        })
    }

    /// Connect using `TREADLE_SQLITE_URL` (with `.env` support via dotenvy),
    /// falling back to `sqlite://treadle.db`.
    pub async fn connect_default() -> Result<Self> {
        dotenvy::dotenv().ok();
        let url = std::env::var(DATABASE_URL_VAR)
            .unwrap_or_else(|_| "sqlite://treadle.db".to_string());
        Self::connect(&url).await
    }
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::IdempotencyViolation {
                key: db.message().to_string(),
            };
        }
    }
    StoreError::Backend {
        message: e.to_string(),
    }
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord> {
    let payload: String = row.get("payload_json");
    serde_json::from_str(&payload).map_err(Into::into)
}

#[async_trait]
impl<S> CheckpointStore<S> for SqliteStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn save_step(
        &self,
        run_id: &RunId,
        step_id: StepId,
        node: &NodeId,
        state: &S,
    ) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT OR REPLACE INTO steps (run_id, step_id, node_id, state_json, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id.as_str())
        .bind(step_id as i64)
        .bind(node.as_str())
        .bind(state_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_latest(&self, run_id: &RunId) -> Result<(S, StepId)> {
        let row = sqlx::query(
            "SELECT state_json, step_id FROM steps
             WHERE run_id = ? ORDER BY step_id DESC LIMIT 1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or_else(|| StoreError::NotFound {
            run_id: run_id.clone(),
            step_id: None,
        })?;
        let state_json: String = row.get("state_json");
        let step_id: i64 = row.get("step_id");
        Ok((serde_json::from_str(&state_json)?, step_id as StepId))
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint<S>,
        events: &[EventRecord],
    ) -> Result<()> {
        let payload = serde_json::to_string(checkpoint)?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let existing = sqlx::query("SELECT 1 FROM idempotency_keys WHERE key = ?")
            .bind(&checkpoint.idempotency_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if existing.is_some() {
            return Err(StoreError::IdempotencyViolation {
                key: checkpoint.idempotency_key.clone(),
            });
        }

        sqlx::query(
            "INSERT INTO idempotency_keys (key, run_id, step_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.idempotency_key)
        .bind(checkpoint.run_id.as_str())
        .bind(checkpoint.step_id as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            "INSERT INTO checkpoints (run_id, step_id, payload_json, idempotency_key, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(checkpoint.run_id.as_str())
        .bind(checkpoint.step_id as i64)
        .bind(payload)
        .bind(&checkpoint.idempotency_key)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for event in events {
            sqlx::query(
                "INSERT INTO outbox_events
                     (event_id, run_id, step_id, node_id, kind, payload_json, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.event_id)
            .bind(event.run_id.as_str())
            .bind(event.step_id as i64)
            .bind(event.node.as_ref().map(NodeId::as_str))
            .bind(serde_json::to_string(&event.kind)?)
            .bind(serde_json::to_string(event)?)
            .bind(event.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)
    }

    async fn load_checkpoint(&self, run_id: &RunId, step_id: StepId) -> Result<Checkpoint<S>> {
        let row = sqlx::query(
            "SELECT payload_json FROM checkpoints WHERE run_id = ? AND step_id = ?",
        )
        .bind(run_id.as_str())
        .bind(step_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or_else(|| StoreError::NotFound {
            run_id: run_id.clone(),
            step_id: Some(step_id),
        })?;
        let payload: String = row.get("payload_json");
        serde_json::from_str(&payload).map_err(Into::into)
    }

    async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint<S>>> {
        let row = sqlx::query(
            "SELECT payload_json FROM checkpoints
             WHERE run_id = ? ORDER BY step_id DESC LIMIT 1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload_json");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn check_idempotency(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM idempotency_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            "SELECT payload_json FROM outbox_events
             WHERE emitted_at IS NULL ORDER BY created_at, event_id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn mark_events_emitted(&self, event_ids: &[String]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for event_id in event_ids {
            sqlx::query("UPDATE outbox_events SET emitted_at = ? WHERE event_id = ?")
                .bind(&now)
                .bind(event_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>> {
        let rows = sqlx::query(
            "SELECT run_id FROM checkpoints
             UNION SELECT run_id FROM steps ORDER BY run_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .iter()
            .map(|row| RunId::new(row.get::<String, _>("run_id")))
            .collect())
    }
}
