//! Database module
//!
//! Connectivity and schema checks for the PostgreSQL store. The schema itself
//! is raw SQL in `migrations/`.

use sqlx::PgPool;

/// Tables the PostgreSQL ledger store reads and writes
pub const REQUIRED_TABLES: &[&str] = &["ledger_rows", "record_history", "idempotency_keys"];

/// Simple connectivity check
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    // History rows must never be rewritten; the migration installs a trigger
    let guarded: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.triggers
            WHERE event_object_table = 'record_history'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !guarded {
        tracing::error!("record_history has no append-only trigger");
        return Ok(false);
    }

    tracing::info!("Ledger schema verified");
    Ok(true)
}
