//! PostgreSQL ledger store
//!
//! Rows live as JSONB documents in `ledger_rows`, keyed by (table, id) and
//! always filtered by `owner_id`. Preconditions use JSONB containment, so a
//! compare-and-swap is a single `UPDATE ... WHERE data @> $precondition`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row as _};
use uuid::Uuid;

use super::{row_id, LedgerStore, StoreError};
use crate::audit::{HistoryAction, NewHistoryEntry, RecordHistoryEntry, GENESIS_HASH};
use crate::domain::{fields, FinancialRecord, OwnerId, RecordKind, RecordStatus, Row, Table};
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus, PROCESSING_TIMEOUT_MINUTES};
use crate::projection::{LedgerEntry, LedgerFilter, Pagination};

/// Ledger store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

fn object(value: Value) -> Result<Row, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Unavailable(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Tell a missing row from one whose precondition failed
    async fn missing_or_conflict(&self, owner: OwnerId, table: Table, id: Uuid) -> StoreError {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ledger_rows
                WHERE table_name = $1 AND id = $2 AND owner_id = $3
            )
            "#,
        )
        .bind(table.as_str())
        .bind(id)
        .bind(owner.as_uuid())
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(true) => StoreError::Conflict { table, id },
            Ok(false) => StoreError::NotFound { table, id },
            Err(e) => StoreError::Database(e),
        }
    }

    async fn get_idempotency_key(
        &self,
        owner: OwnerId,
        key: Uuid,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, request_hash, processing_status, response_body,
                   processing_started_at, created_at
            FROM idempotency_keys
            WHERE owner_id = $1 AND key = $2
            "#,
        )
        .bind(owner.as_uuid())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<IdempotencyRecord, StoreError> {
            Ok(IdempotencyRecord {
                key: row.try_get("key")?,
                request_hash: row.try_get("request_hash")?,
                status: IdempotencyStatus::from(row.try_get::<String, _>("processing_status")?),
                response: row.try_get("response_body")?,
                processing_started_at: row.try_get("processing_started_at")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert(&self, owner: OwnerId, table: Table, mut row: Row) -> Result<Row, StoreError> {
        let id = match row_id(&row) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                row.insert("id".into(), Value::from(id.to_string()));
                id
            }
        };
        row.insert("owner_id".into(), Value::from(owner.to_string()));

        let inserted: Option<Value> = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_rows (table_name, id, owner_id, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (table_name, id) DO NOTHING
            RETURNING data
            "#,
        )
        .bind(table.as_str())
        .bind(id)
        .bind(owner.as_uuid())
        .bind(Value::Object(row))
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(data) => object(data),
            None => Err(StoreError::Conflict { table, id }),
        }
    }

    async fn fetch(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
    ) -> Result<Option<Row>, StoreError> {
        let data: Option<Value> = sqlx::query_scalar(
            r#"
            SELECT data FROM ledger_rows
            WHERE table_name = $1 AND id = $2 AND owner_id = $3
            "#,
        )
        .bind(table.as_str())
        .bind(id)
        .bind(owner.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        data.map(object).transpose()
    }

    async fn update(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
        mut fields: Row,
        precondition: Option<&Row>,
    ) -> Result<Row, StoreError> {
        fields.remove("id");
        fields.remove("owner_id");
        let precondition = precondition.cloned().unwrap_or_default();

        let updated: Option<Value> = sqlx::query_scalar(
            r#"
            UPDATE ledger_rows
            SET data = data || $4, updated_at = NOW()
            WHERE table_name = $1 AND id = $2 AND owner_id = $3
              AND data @> $5
            RETURNING data
            "#,
        )
        .bind(table.as_str())
        .bind(id)
        .bind(owner.as_uuid())
        .bind(Value::Object(fields))
        .bind(Value::Object(precondition))
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(data) => object(data),
            None => Err(self.missing_or_conflict(owner, table, id).await),
        }
    }

    async fn delete(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
        precondition: Option<&Row>,
    ) -> Result<(), StoreError> {
        let precondition = precondition.cloned().unwrap_or_default();

        let rows = sqlx::query(
            r#"
            DELETE FROM ledger_rows
            WHERE table_name = $1 AND id = $2 AND owner_id = $3
              AND data @> $4
            "#,
        )
        .bind(table.as_str())
        .bind(id)
        .bind(owner.as_uuid())
        .bind(Value::Object(precondition))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(self.missing_or_conflict(owner, table, id).await);
        }
        Ok(())
    }

    async fn append_audit_entry(
        &self,
        owner: OwnerId,
        entry: NewHistoryEntry,
    ) -> Result<RecordHistoryEntry, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialise appends per record so sequence and hash links stay gapless
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", owner, entry.record_id))
            .execute(&mut *tx)
            .await?;

        let last: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT sequence, current_hash FROM record_history
            WHERE owner_id = $1 AND record_id = $2
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(owner.as_uuid())
        .bind(entry.record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (sequence, previous_hash) = match last {
            Some((sequence, hash)) => (sequence + 1, hash),
            None => (1, GENESIS_HASH.to_string()),
        };
        let sealed = RecordHistoryEntry::seal(owner, entry, sequence, previous_hash);

        sqlx::query(
            r#"
            INSERT INTO record_history (
                id, owner_id, record_type, record_id, sequence, action,
                changes, previous_values, reason, created_at,
                previous_hash, current_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(sealed.id)
        .bind(sealed.owner_id)
        .bind(&sealed.record_type)
        .bind(sealed.record_id)
        .bind(sealed.sequence)
        .bind(sealed.action.as_str())
        .bind(Value::Object(sealed.changes.clone()))
        .bind(sealed.previous_values.clone().map(Value::Object))
        .bind(&sealed.reason)
        .bind(sealed.created_at)
        .bind(&sealed.previous_hash)
        .bind(&sealed.current_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(sealed)
    }

    async fn reverse_by_type(
        &self,
        owner: OwnerId,
        kind: RecordKind,
        id: Uuid,
        reason: &str,
    ) -> Result<Row, StoreError> {
        let table = kind.table();
        let guard = fields([
            ("kind", Value::from(kind.as_str())),
            ("status", Value::from(RecordStatus::Confirmed.as_str())),
            ("provisional", Value::Bool(false)),
        ]);
        let changes = fields([
            ("status", Value::from(RecordStatus::Reversed.as_str())),
            ("reversal_reason", Value::from(reason)),
            ("reversed_at", Value::from(Utc::now().to_rfc3339())),
        ]);

        let before: Option<Value> = sqlx::query_scalar(
            r#"
            WITH prior AS (
                SELECT data FROM ledger_rows
                WHERE table_name = $1 AND id = $2 AND owner_id = $3
                  AND data @> $4
                FOR UPDATE
            )
            UPDATE ledger_rows r
            SET data = r.data || $5, updated_at = NOW()
            FROM prior
            WHERE r.table_name = $1 AND r.id = $2 AND r.owner_id = $3
            RETURNING prior.data
            "#,
        )
        .bind(table.as_str())
        .bind(id)
        .bind(owner.as_uuid())
        .bind(Value::Object(guard))
        .bind(Value::Object(changes))
        .fetch_optional(&self.pool)
        .await?;

        match before {
            Some(data) => object(data),
            None => Err(self.missing_or_conflict(owner, table, id).await),
        }
    }

    async fn fetch_ledger_entries(
        &self,
        owner: OwnerId,
        filter: &LedgerFilter,
        page: Pagination,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables: Vec<String> = Table::financial()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();

        let rows: Vec<Value> = sqlx::query_scalar(
            r#"
            SELECT data FROM ledger_rows
            WHERE owner_id = $1
              AND table_name = ANY($2)
              AND data @> '{"provisional": false}'
              AND ($3::text IS NULL OR data->>'kind' = $3)
              AND ($4::text IS NULL OR data->>'status' = $4)
              AND ($5::timestamptz IS NULL OR (data->>'created_at')::timestamptz >= $5)
              AND ($6::timestamptz IS NULL OR (data->>'created_at')::timestamptz <= $6)
            ORDER BY (data->>'created_at')::timestamptz DESC, id DESC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(owner.as_uuid())
        .bind(&tables)
        .bind(filter.record_type.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.from)
        .bind(filter.to)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|data| -> Result<LedgerEntry, StoreError> {
                let record = FinancialRecord::from_row(object(data)?)?;
                Ok(LedgerEntry::from_record(&record))
            })
            .collect()
    }

    async fn fetch_history(
        &self,
        owner: OwnerId,
        record_id: Uuid,
    ) -> Result<Vec<RecordHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, record_type, record_id, sequence, action,
                   changes, previous_values, reason, created_at,
                   previous_hash, current_hash
            FROM record_history
            WHERE owner_id = $1 AND record_id = $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(owner.as_uuid())
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<RecordHistoryEntry, StoreError> {
                let action: String = row.try_get("action")?;
                let previous_values: Option<Value> = row.try_get("previous_values")?;
                Ok(RecordHistoryEntry {
                    id: row.try_get("id")?,
                    owner_id: row.try_get("owner_id")?,
                    record_type: row.try_get("record_type")?,
                    record_id: row.try_get("record_id")?,
                    sequence: row.try_get("sequence")?,
                    action: HistoryAction::parse(&action).ok_or_else(|| {
                        StoreError::Unavailable(format!("unknown history action '{}'", action))
                    })?,
                    changes: object(row.try_get("changes")?)?,
                    previous_values: previous_values.map(object).transpose()?,
                    reason: row.try_get("reason")?,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                    previous_hash: row.try_get("previous_hash")?,
                    current_hash: row.try_get("current_hash")?,
                })
            })
            .collect()
    }

    async fn start_idempotent(
        &self,
        owner: OwnerId,
        key: Uuid,
        request_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (owner_id, key, request_hash, processing_status, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (owner_id, key) DO NOTHING
            "#,
        )
        .bind(owner.as_uuid())
        .bind(key)
        .bind(request_hash)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(None);
        }

        let Some(existing) = self.get_idempotency_key(owner, key).await? else {
            return Err(StoreError::IdempotencyInProgress);
        };

        if existing.request_hash != request_hash {
            return Err(StoreError::IdempotencyMismatch);
        }

        match existing.status {
            IdempotencyStatus::Completed => Ok(Some(existing)),
            IdempotencyStatus::Processing
                if (Utc::now() - existing.processing_started_at).num_minutes()
                    < PROCESSING_TIMEOUT_MINUTES =>
            {
                Err(StoreError::IdempotencyInProgress)
            }
            // Failed or stuck processing: take it over unless someone else just did
            _ => {
                let taken = sqlx::query(
                    r#"
                    UPDATE idempotency_keys
                    SET processing_status = 'processing', processing_started_at = NOW()
                    WHERE owner_id = $1 AND key = $2
                      AND processing_status = $3 AND processing_started_at = $4
                    "#,
                )
                .bind(owner.as_uuid())
                .bind(key)
                .bind(existing.status.as_str())
                .bind(existing.processing_started_at)
                .execute(&self.pool)
                .await?
                .rows_affected();

                if taken == 0 {
                    return Err(StoreError::IdempotencyInProgress);
                }
                Ok(None)
            }
        }
    }

    async fn complete_idempotent(
        &self,
        owner: OwnerId,
        key: Uuid,
        response: Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET processing_status = 'completed', response_body = $3
            WHERE owner_id = $1 AND key = $2
            "#,
        )
        .bind(owner.as_uuid())
        .bind(key)
        .bind(response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_idempotent(&self, owner: OwnerId, key: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET processing_status = 'failed'
            WHERE owner_id = $1 AND key = $2
            "#,
        )
        .bind(owner.as_uuid())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
