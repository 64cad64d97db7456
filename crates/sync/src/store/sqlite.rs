//! SQLite-backed action store.
//!
//! Pending actions are persisted in a durable `pending_actions` table so the
//! queue survives reloads and crashes. Timestamps are stored as RFC 3339
//! text; payloads as JSON text.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use fablink_core::ActionId;

use super::{ActionStore, DEFAULT_CAPACITY, StorageInfo, StoreError, requeue_interrupted};
use crate::action::{ActionKind, ActionStatus, EntityKey, PendingAction};

/// Durable SQLite store.
///
/// Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct SqliteActionStore {
    pool: SqlitePool,
    capacity: usize,
}

impl SqliteActionStore {
    /// Open (or create) the store at the default per-user location:
    /// `{app_data_dir}/fablink/actions.db`.
    pub async fn open_default() -> anyhow::Result<Self> {
        Self::open_at(&default_db_path()?, DEFAULT_CAPACITY).await
    }

    /// Open (or create) the store at an explicit path.
    pub async fn open_at(path: &Path, capacity: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create action store directory at {parent:?}"))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open action store at {path:?}"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_actions (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                entity      TEXT NOT NULL,
                payload     TEXT NOT NULL,
                signature   TEXT NULL,
                optimistic  TEXT NULL,
                status      TEXT NOT NULL,
                attempts    INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                last_error  TEXT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create pending_actions table")?;

        Ok(Self { pool, capacity })
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_actions")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        row.try_get::<i64, _>("n").map_err(storage_err)
    }
}

#[async_trait]
impl ActionStore for SqliteActionStore {
    async fn load(&self) -> Result<Vec<PendingAction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, entity, payload, signature, optimistic,
                   status, attempts, created_at, last_error
            FROM pending_actions
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            // A single unreadable record must not fail the whole rehydration.
            match row_to_action(row) {
                Ok(action) => actions.push(action),
                Err(err) => {
                    tracing::warn!("skipping unreadable pending action record: {err:?}");
                }
            }
        }

        requeue_interrupted(&mut actions);
        Ok(actions)
    }

    async fn append(&self, action: &PendingAction) -> Result<(), StoreError> {
        if self.count().await? >= self.capacity as i64 {
            return Err(StoreError::Full {
                capacity: self.capacity,
            });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO pending_actions (
                id, kind, entity, payload, signature, optimistic,
                status, attempts, created_at, last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(action.id.to_string())
        .bind(action.kind.as_str())
        .bind(action.entity.as_str())
        .bind(action.payload.to_string())
        .bind(action.signature.as_deref())
        .bind(action.optimistic.as_ref().map(|v| v.to_string()))
        .bind(action.status.as_str())
        .bind(action.attempts as i64)
        .bind(action.created_at.to_rfc3339())
        .bind(action.last_error.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(action.id))
            }
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn update_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_actions
            SET status = ?2, attempts = ?3, last_error = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(attempts as i64)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn replace_payload(
        &self,
        id: ActionId,
        payload: &Value,
        optimistic: Option<&Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_actions
            SET payload = ?2, optimistic = ?3
            WHERE id = ?1 AND status = 'queued'
            "#,
        )
        .bind(id.to_string())
        .bind(payload.to_string())
        .bind(optimistic.map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn remove(&self, id: ActionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_actions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_actions")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n,
                   COALESCE(SUM(
                       LENGTH(payload) + LENGTH(COALESCE(optimistic, ''))
                       + LENGTH(entity) + LENGTH(kind) + LENGTH(id)
                   ), 0) AS bytes
            FROM pending_actions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let count: i64 = row.try_get("n").map_err(storage_err)?;
        let bytes: i64 = row.try_get("bytes").map_err(storage_err)?;

        Ok(StorageInfo {
            action_count: count.max(0) as usize,
            approx_bytes: bytes.max(0) as u64,
            capacity: self.capacity,
        })
    }
}

fn storage_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(err.to_string())
}

/// Map a database row into a `PendingAction`.
fn row_to_action(row: SqliteRow) -> anyhow::Result<PendingAction> {
    let id_str: String = row.try_get("id")?;
    let id = ActionId::from_uuid(
        Uuid::parse_str(&id_str).context("invalid UUID in pending_actions.id")?,
    );

    let kind_str: String = row.try_get("kind")?;
    let kind = ActionKind::parse(&kind_str);

    let entity_str: String = row.try_get("entity")?;
    let entity = EntityKey::from(entity_str);

    let payload_str: String = row.try_get("payload")?;
    let payload: Value =
        serde_json::from_str(&payload_str).context("invalid JSON payload in pending_actions")?;

    let signature: Option<String> = row.try_get("signature")?;

    let optimistic_str: Option<String> = row.try_get("optimistic")?;
    let optimistic = match optimistic_str {
        Some(s) => Some(
            serde_json::from_str(&s).context("invalid optimistic patch in pending_actions")?,
        ),
        None => None,
    };

    let status_str: String = row.try_get("status")?;
    let status = ActionStatus::parse(&status_str)
        .ok_or_else(|| anyhow::anyhow!("unknown action status '{}' in pending_actions", status_str))?;

    let attempts: i64 = row.try_get("attempts")?;

    let created_at_str: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .context("invalid created_at in pending_actions")?;

    let last_error: Option<String> = row.try_get("last_error")?;

    Ok(PendingAction {
        id,
        kind,
        entity,
        payload,
        signature,
        optimistic,
        status,
        attempts: attempts.max(0) as u32,
        created_at,
        last_error,
    })
}

/// Resolve the default path to the SQLite database:
/// `{app_data_dir}/fablink/actions.db`.
fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory")?;

    let mut dir = base;
    dir.push("fablink");
    dir.push("actions.db");
    Ok(dir)
}
