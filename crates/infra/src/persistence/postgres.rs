//! Postgres-backed persistence.
//!
//! ## Schema
//!
//! - `events`: primary key `(aggregate_id, version, sequence)`; a concurrent
//!   writer that lost the race hits the key and gets `23505`
//! - `snapshots`: one row per `(aggregate_id, version)`, latest wins on read
//! - `sagas`: keyed by `saga_id`, secondary index on
//!   `(saga_type, correlation_property, correlation_value)` with a binary value
//! - `outbox`: `(due_at, "offset", id)` ordered queue; the relay leases rows
//!   (`leased_until`, database clock) and deletes them once acknowledged
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | BackendError |
//! |------------|----------------------|--------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use eventide_core::{AggregateId, CorrelationId, MessageId};
use eventide_events::Envelope;

use super::backend::{
    BackendError, BackendTransaction, Correlation, EventRecord, OutboxRecord, PersistenceBackend, SagaRecord,
    SnapshotRecord,
};

/// DDL for every table the backend uses. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    aggregate_id   UUID        NOT NULL,
    version        BIGINT      NOT NULL CHECK (version >= 0),
    sequence       INTEGER     NOT NULL CHECK (sequence >= 0),
    message_id     UUID        NOT NULL,
    correlation_id UUID        NOT NULL,
    causation_id   UUID        NULL,
    message_type   TEXT        NOT NULL,
    revision       INTEGER     NOT NULL,
    recorded_on    TIMESTAMPTZ NOT NULL,
    payload        JSONB       NOT NULL,
    PRIMARY KEY (aggregate_id, version, sequence)
);

CREATE TABLE IF NOT EXISTS snapshots (
    aggregate_id  UUID        NOT NULL,
    version       BIGINT      NOT NULL,
    snapshot_type TEXT        NOT NULL,
    revision      INTEGER     NOT NULL,
    taken_on      TIMESTAMPTZ NOT NULL,
    state         JSONB       NOT NULL,
    PRIMARY KEY (aggregate_id, version)
);

CREATE TABLE IF NOT EXISTS sagas (
    saga_id              UUID    PRIMARY KEY,
    saga_type            TEXT    NOT NULL,
    version              BIGINT  NOT NULL,
    completed            BOOLEAN NOT NULL DEFAULT FALSE,
    correlation_property TEXT    NOT NULL,
    correlation_value    BYTEA   NOT NULL,
    state                JSONB   NOT NULL
);

CREATE INDEX IF NOT EXISTS sagas_correlation_idx
    ON sagas (saga_type, correlation_property, correlation_value);

CREATE TABLE IF NOT EXISTS outbox (
    id           BIGSERIAL   PRIMARY KEY,
    due_at       TIMESTAMPTZ NOT NULL,
    "offset"     BIGINT      NOT NULL,
    message_id   UUID        NOT NULL,
    leased_until TIMESTAMPTZ NULL,
    envelope     JSONB       NOT NULL
);

CREATE INDEX IF NOT EXISTS outbox_due_idx ON outbox (due_at, "offset", id);
CREATE INDEX IF NOT EXISTS outbox_message_idx ON outbox (message_id);
"#;

/// Postgres backend over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a small default pool (e.g. from `DATABASE_URL`).
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), BackendError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        debug!("schema ready");
        Ok(())
    }
}

#[async_trait]
impl PersistenceBackend for PostgresBackend {
    async fn begin(&self) -> Result<Box<dyn BackendTransaction>, BackendError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn current_version(&self, aggregate_id: AggregateId) -> Result<Option<u64>, BackendError> {
        let row = sqlx::query("SELECT MAX(version) AS current_version FROM events WHERE aggregate_id = $1")
            .bind(aggregate_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_version", e))?;
        read_version(&row)
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn load_events(
        &self,
        aggregate_id: AggregateId,
        after: Option<u64>,
    ) -> Result<Vec<EventRecord>, BackendError> {
        let rows = sqlx::query(
            r#"
            SELECT
                aggregate_id, version, sequence, message_id, correlation_id, causation_id,
                message_type, revision, recorded_on, payload
            FROM events
            WHERE aggregate_id = $1 AND ($2::bigint IS NULL OR version > $2)
            ORDER BY version ASC, sequence ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(after.map(|v| v as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_events", e))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<SnapshotRecord>, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, version, snapshot_type, revision, taken_on, state
            FROM snapshots
            WHERE aggregate_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    #[instrument(skip(self, snapshot), fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version), err)]
    async fn store_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, version, snapshot_type, revision, taken_on, state)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (aggregate_id, version)
            DO UPDATE SET
                state = EXCLUDED.state,
                revision = EXCLUDED.revision,
                taken_on = EXCLUDED.taken_on
            "#,
        )
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(snapshot.version as i64)
        .bind(&snapshot.snapshot_type)
        .bind(snapshot.revision as i32)
        .bind(snapshot.taken_on)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_snapshot", e))?;
        Ok(())
    }

    async fn load_saga(&self, saga_id: AggregateId) -> Result<Option<SagaRecord>, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, saga_type, version, completed, correlation_property, correlation_value, state
            FROM sagas
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_saga", e))?;

        row.as_ref().map(saga_from_row).transpose()
    }

    async fn find_saga(
        &self,
        saga_type: &str,
        correlation: &Correlation,
    ) -> Result<Option<SagaRecord>, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, saga_type, version, completed, correlation_property, correlation_value, state
            FROM sagas
            WHERE saga_type = $1
              AND correlation_property = $2
              AND correlation_value = $3
              AND NOT completed
            LIMIT 1
            "#,
        )
        .bind(saga_type)
        .bind(&correlation.property)
        .bind(correlation.value.as_bytes())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_saga", e))?;

        row.as_ref().map(saga_from_row).transpose()
    }

    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, BackendError> {
        let rows = sqlx::query(
            r#"
            UPDATE outbox
            SET leased_until = now() + make_interval(secs => $3)
            WHERE id IN (
                SELECT id FROM outbox
                WHERE due_at <= $1
                  AND (leased_until IS NULL OR leased_until <= now())
                ORDER BY due_at, "offset", id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, due_at, "offset", envelope
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease_due", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("lease_due", e))?;
            records.push((id, outbox_from_row(row)?));
        }
        records.sort_by_key(|(id, r)| (r.due_at, r.offset, *id));
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }

    async fn acknowledge(&self, message_id: MessageId) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM outbox WHERE message_id = $1")
            .bind(message_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("acknowledge", e))?;
        Ok(())
    }

    async fn release(&self, message_ids: &[MessageId]) -> Result<(), BackendError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<uuid::Uuid> = message_ids.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query("UPDATE outbox SET leased_until = NULL WHERE message_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn saga_version(&mut self, saga_id: AggregateId) -> Result<Option<u64>, BackendError> {
        let row = sqlx::query("SELECT version FROM sagas WHERE saga_id = $1 FOR UPDATE")
            .bind(saga_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("saga_version", e))?;
        row.map(|r| r.try_get::<i64, _>("version").map(|v| v as u64))
            .transpose()
            .map_err(|e| map_sqlx_error("saga_version", e))
    }

    async fn check_saga_version(&mut self, saga_id: AggregateId, expected: u64) -> Result<(), BackendError> {
        match self.saga_version(saga_id).await? {
            Some(actual) if actual == expected => Ok(()),
            actual => Err(BackendError::StaleVersion {
                key: format!("saga {saga_id}"),
                expected,
                actual,
            }),
        }
    }
}

#[async_trait]
impl BackendTransaction for PostgresTransaction {
    async fn current_version(&mut self, aggregate_id: AggregateId) -> Result<Option<u64>, BackendError> {
        let row = sqlx::query("SELECT MAX(version) AS current_version FROM events WHERE aggregate_id = $1")
            .bind(aggregate_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("current_version", e))?;
        read_version(&row)
    }

    async fn append_event(&mut self, record: EventRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO events (
                aggregate_id, version, sequence, message_id, correlation_id, causation_id,
                message_type, revision, recorded_on, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.aggregate_id.as_uuid())
        .bind(record.version as i64)
        .bind(record.sequence as i32)
        .bind(record.message_id.as_uuid())
        .bind(record.correlation_id.as_uuid())
        .bind(record.causation_id.map(|id| *id.as_uuid()))
        .bind(&record.message_type)
        .bind(record.revision as i32)
        .bind(record.recorded_on)
        .bind(&record.payload)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_event", e))?;
        Ok(())
    }

    async fn insert_saga(&mut self, record: SagaRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO sagas (
                saga_id, saga_type, version, completed, correlation_property, correlation_value, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(&record.saga_type)
        .bind(record.version as i64)
        .bind(record.completed)
        .bind(&record.correlation.property)
        .bind(record.correlation.value.as_bytes())
        .bind(&record.state)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_saga", e))?;
        Ok(())
    }

    async fn update_saga(&mut self, record: SagaRecord, expected_version: u64) -> Result<(), BackendError> {
        self.check_saga_version(record.saga_id, expected_version).await?;
        sqlx::query(
            r#"
            UPDATE sagas
            SET version = $2,
                completed = $3,
                correlation_property = $4,
                correlation_value = $5,
                state = $6
            WHERE saga_id = $1
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(record.version as i64)
        .bind(record.completed)
        .bind(&record.correlation.property)
        .bind(record.correlation.value.as_bytes())
        .bind(&record.state)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_saga", e))?;
        Ok(())
    }

    async fn complete_saga(&mut self, record: SagaRecord, expected_version: u64) -> Result<(), BackendError> {
        self.update_saga(
            SagaRecord {
                completed: true,
                ..record
            },
            expected_version,
        )
        .await
    }

    async fn enqueue(&mut self, record: OutboxRecord) -> Result<(), BackendError> {
        let envelope = serde_json::to_value(&record.envelope)?;
        sqlx::query(r#"INSERT INTO outbox (due_at, "offset", message_id, envelope) VALUES ($1, $2, $3, $4)"#)
            .bind(record.due_at)
            .bind(record.offset as i64)
            .bind(*record.envelope.message_id().as_uuid())
            .bind(envelope)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), BackendError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn read_version(row: &PgRow) -> Result<Option<u64>, BackendError> {
    let version: Option<i64> = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("current_version", e))?;
    Ok(version.map(|v| v as u64))
}

fn event_from_row(row: &PgRow) -> Result<EventRecord, BackendError> {
    let read = |e| map_sqlx_error("read_event_row", e);
    Ok(EventRecord {
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(read)?),
        version: row.try_get::<i64, _>("version").map_err(read)? as u64,
        sequence: row.try_get::<i32, _>("sequence").map_err(read)? as u32,
        message_id: MessageId::from_uuid(row.try_get("message_id").map_err(read)?),
        correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id").map_err(read)?),
        causation_id: row
            .try_get::<Option<uuid::Uuid>, _>("causation_id")
            .map_err(read)?
            .map(MessageId::from_uuid),
        message_type: row.try_get("message_type").map_err(read)?,
        revision: row.try_get::<i32, _>("revision").map_err(read)? as u32,
        recorded_on: row.try_get("recorded_on").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<SnapshotRecord, BackendError> {
    let read = |e| map_sqlx_error("read_snapshot_row", e);
    Ok(SnapshotRecord {
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(read)?),
        version: row.try_get::<i64, _>("version").map_err(read)? as u64,
        snapshot_type: row.try_get("snapshot_type").map_err(read)?,
        revision: row.try_get::<i32, _>("revision").map_err(read)? as u32,
        taken_on: row.try_get("taken_on").map_err(read)?,
        state: row.try_get("state").map_err(read)?,
    })
}

fn saga_from_row(row: &PgRow) -> Result<SagaRecord, BackendError> {
    let read = |e| map_sqlx_error("read_saga_row", e);
    let value: Vec<u8> = row.try_get("correlation_value").map_err(read)?;
    Ok(SagaRecord {
        saga_id: AggregateId::from_uuid(row.try_get("saga_id").map_err(read)?),
        saga_type: row.try_get("saga_type").map_err(read)?,
        version: row.try_get::<i64, _>("version").map_err(read)? as u64,
        completed: row.try_get("completed").map_err(read)?,
        correlation: Correlation {
            property: row.try_get("correlation_property").map_err(read)?,
            value: String::from_utf8(value)
                .map_err(|e| BackendError::storage("read_saga_row", format!("correlation value: {e}")))?,
        },
        state: row.try_get("state").map_err(read)?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxRecord, BackendError> {
    let read = |e| map_sqlx_error("read_outbox_row", e);
    let envelope: serde_json::Value = row.try_get("envelope").map_err(read)?;
    Ok(OutboxRecord {
        due_at: row.try_get("due_at").map_err(read)?,
        offset: row.try_get::<i64, _>("offset").map_err(read)? as u64,
        envelope: serde_json::from_value::<Envelope>(envelope)?,
    })
}

/// Map SQLx errors to `BackendError`.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => BackendError::UniqueViolation(msg),
                _ => BackendError::storage(operation, msg),
            }
        }
        sqlx::Error::PoolClosed => BackendError::storage(operation, "connection pool closed"),
        other => BackendError::storage(operation, other.to_string()),
    }
}
