// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! PostgreSQL writer.
//!
//! Idempotency is enforced at the row level: `punches.source_hash` carries a
//! unique constraint and every insert is `ON CONFLICT DO NOTHING`, so
//! concurrent writers may coexist and replays are harmless. The schema is
//! versioned through a `schema_version` table; pending migrations run inside
//! `connect()` before any write is accepted.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use foreman_core::{
    CardRequirement, MessageRecord, Punch, PunchType, SessionRecord, ToolCallRecord,
};

use crate::error::StoreError;
use crate::store::Store;

/// Ordered migration list. Append only: released versions never change.
const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS punches (
            id BIGSERIAL PRIMARY KEY,
            task_id TEXT NOT NULL,
            punch_type TEXT NOT NULL,
            punch_key TEXT NOT NULL,
            observed_at TIMESTAMPTZ NOT NULL,
            source_hash TEXT NOT NULL UNIQUE,
            content_hash TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_punches_task_type
            ON punches (task_id, punch_type);

        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            task_id TEXT,
            mode TEXT,
            model TEXT,
            status TEXT NOT NULL,
            total_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
            tokens_in BIGINT NOT NULL DEFAULT 0,
            tokens_out BIGINT NOT NULL DEFAULT 0,
            tokens_reasoning BIGINT NOT NULL DEFAULT 0,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            outcome TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id BIGSERIAL PRIMARY KEY,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content_type TEXT NOT NULL,
            content_preview TEXT NOT NULL,
            ts TIMESTAMPTZ NOT NULL,
            UNIQUE (session_id, ts, role)
        );

        CREATE TABLE IF NOT EXISTS tool_calls (
            id BIGSERIAL PRIMARY KEY,
            session_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            args_summary TEXT,
            status TEXT,
            error TEXT,
            duration_ms BIGINT,
            ts TIMESTAMPTZ NOT NULL,
            UNIQUE (session_id, ts, tool_name)
        );

        CREATE TABLE IF NOT EXISTS child_rels (
            parent_id TEXT NOT NULL,
            child_id TEXT NOT NULL,
            UNIQUE (parent_id, child_id)
        );

        CREATE TABLE IF NOT EXISTS punch_cards (
            id BIGSERIAL PRIMARY KEY,
            card_id TEXT NOT NULL,
            punch_type TEXT NOT NULL,
            punch_key_pattern TEXT NOT NULL,
            required BOOLEAN NOT NULL DEFAULT TRUE,
            forbidden BOOLEAN NOT NULL DEFAULT FALSE,
            description TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_punch_cards_card ON punch_cards (card_id);
        "#,
    ),
];

/// Optional metric columns added best-effort at connect time. Pre-existing
/// columns make these statements fail; that failure is expected and ignored.
const METRIC_COLUMNS: &[&str] = &[
    "ALTER TABLE punches ADD COLUMN cost DOUBLE PRECISION",
    "ALTER TABLE punches ADD COLUMN tokens_input BIGINT",
    "ALTER TABLE punches ADD COLUMN tokens_output BIGINT",
    "ALTER TABLE punches ADD COLUMN tokens_reasoning BIGINT",
    "ALTER TABLE messages ADD COLUMN cost DOUBLE PRECISION",
    "ALTER TABLE messages ADD COLUMN tokens_in BIGINT",
    "ALTER TABLE messages ADD COLUMN tokens_out BIGINT",
    "ALTER TABLE tool_calls ADD COLUMN cost DOUBLE PRECISION",
];

pub struct PgStore {
    url: String,
    pool: RwLock<Option<PgPool>>,
}

impl PgStore {
    /// A store bound to a PostgreSQL DSN. No connection is made until
    /// [`Store::connect`].
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(StoreError::NotConnected)
    }

    async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                 version INTEGER PRIMARY KEY,
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;

        let current: Option<i32> =
            sqlx::query_scalar("SELECT max(version) FROM schema_version")
                .fetch_one(pool)
                .await?;
        let current = current.unwrap_or(0);

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            debug!(version, "applying store migration");
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(*sql)
                .execute(tx.as_mut())
                .await
                .map_err(|source| StoreError::Migration {
                    version: *version,
                    source,
                })?;
            sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
                .bind(version)
                .execute(tx.as_mut())
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn ensure_metric_columns(pool: &PgPool) {
        for stmt in METRIC_COLUMNS {
            if let Err(e) = sqlx::query(*stmt).execute(pool).await {
                // Almost always "column already exists"; anything else will
                // resurface on the first real write.
                debug!(stmt, error = %e, "metric column add skipped");
            }
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&self.url)
            .await?;
        Self::run_migrations(&pool).await?;
        Self::ensure_metric_columns(&pool).await;
        info!("punch store connected");
        *guard = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn write_punch(&self, punch: &Punch) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let result = sqlx::query(
            "INSERT INTO punches
                 (task_id, punch_type, punch_key, observed_at, source_hash,
                  content_hash, cost, tokens_input, tokens_output, tokens_reasoning)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (source_hash) DO NOTHING",
        )
        .bind(&punch.task_id)
        .bind(punch.punch_type.as_str())
        .bind(&punch.punch_key)
        .bind(punch.observed_at)
        .bind(&punch.source_hash)
        .bind(&punch.content_hash)
        .bind(punch.cost)
        .bind(punch.tokens_input)
        .bind(punch.tokens_output)
        .bind(punch.tokens_reasoning)
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query(
            "INSERT INTO sessions
                 (session_id, task_id, mode, model, status, total_cost,
                  tokens_in, tokens_out, tokens_reasoning,
                  started_at, completed_at, outcome)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (session_id) DO UPDATE SET
                 status = EXCLUDED.status,
                 total_cost = EXCLUDED.total_cost,
                 tokens_in = EXCLUDED.tokens_in,
                 tokens_out = EXCLUDED.tokens_out,
                 tokens_reasoning = EXCLUDED.tokens_reasoning,
                 completed_at = EXCLUDED.completed_at,
                 outcome = EXCLUDED.outcome",
        )
        .bind(&session.session_id)
        .bind(&session.task_id)
        .bind(&session.mode)
        .bind(&session.model)
        .bind(&session.status)
        .bind(session.total_cost)
        .bind(session.tokens_in)
        .bind(session.tokens_out)
        .bind(session.tokens_reasoning)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(&session.outcome)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn write_message(&self, message: &MessageRecord) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let result = sqlx::query(
            "INSERT INTO messages
                 (session_id, role, content_type, content_preview, ts,
                  cost, tokens_in, tokens_out)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (session_id, ts, role) DO NOTHING",
        )
        .bind(&message.session_id)
        .bind(&message.role)
        .bind(&message.content_type)
        .bind(&message.content_preview)
        .bind(message.ts)
        .bind(message.cost)
        .bind(message.tokens_in)
        .bind(message.tokens_out)
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_tool_call(&self, call: &ToolCallRecord) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let result = sqlx::query(
            "INSERT INTO tool_calls
                 (session_id, tool_name, args_summary, status, error,
                  duration_ms, cost, ts)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (session_id, ts, tool_name) DO NOTHING",
        )
        .bind(&call.session_id)
        .bind(&call.tool_name)
        .bind(&call.args_summary)
        .bind(&call.status)
        .bind(&call.error)
        .bind(call.duration_ms)
        .bind(call.cost)
        .bind(call.ts)
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_child_relation(&self, parent: &str, child: &str) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let result = sqlx::query(
            "INSERT INTO child_rels (parent_id, child_id)
             VALUES ($1, $2)
             ON CONFLICT (parent_id, child_id) DO NOTHING",
        )
        .bind(parent)
        .bind(child)
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sync_child_rels_from_punches(&self) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        // 'child_spawned:' is 14 characters; the child id starts at 15.
        let result = sqlx::query(
            "INSERT INTO child_rels (parent_id, child_id)
             SELECT DISTINCT task_id, substr(punch_key, 15)
             FROM punches
             WHERE punch_type IN ('session_lifecycle', 'workflow')
               AND punch_key LIKE 'child_spawned:%'
               AND length(punch_key) > 14
             ON CONFLICT (parent_id, child_id) DO NOTHING",
        )
        .execute(&pool)
        .await?;
        let inserted = result.rows_affected();
        if inserted > 0 {
            info!(inserted, "child relations recovered from punches");
        }
        Ok(inserted)
    }

    async fn count_punches(
        &self,
        task_id: &str,
        punch_type: PunchType,
        key_pattern: &str,
    ) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM punches
             WHERE task_id = $1 AND punch_type = $2 AND punch_key LIKE $3",
        )
        .bind(task_id)
        .bind(punch_type.as_str())
        .bind(key_pattern)
        .fetch_one(&pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn card_requirements(&self, card_id: &str) -> Result<Vec<CardRequirement>, StoreError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT card_id, punch_type, punch_key_pattern, required, forbidden, description
             FROM punch_cards WHERE card_id = $1 ORDER BY id",
        )
        .bind(card_id)
        .fetch_all(&pool)
        .await?;

        let mut requirements = Vec::with_capacity(rows.len());
        for row in rows {
            let type_name: String = row.get("punch_type");
            let Some(punch_type) = PunchType::parse(&type_name) else {
                warn!(card_id, type_name, "skipping card row with unknown punch type");
                continue;
            };
            requirements.push(CardRequirement {
                card_id: row.get("card_id"),
                punch_type,
                punch_key_pattern: row.get("punch_key_pattern"),
                required: row.get("required"),
                forbidden: row.get("forbidden"),
                description: row.get("description"),
            });
        }
        Ok(requirements)
    }

    async fn children_of(&self, parent_id: &str) -> Result<Vec<String>, StoreError> {
        let pool = self.pool().await?;
        let ids = sqlx::query_scalar(
            "SELECT child_id FROM child_rels WHERE parent_id = $1 ORDER BY child_id",
        )
        .bind(parent_id)
        .fetch_all(&pool)
        .await?;
        Ok(ids)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
