//! SQLite persistence for appointments and push subscriptions.

use std::collections::BTreeSet;

use bban_core::{Appointment, AppointmentCandidate, Subscription};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;

pub use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "bban-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decoding subscription preferences: {0}")]
    Preferences(#[from] serde_json::Error),
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS appointments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    location TEXT NOT NULL,
    office_id INTEGER NOT NULL,
    service_id INTEGER NOT NULL,
    start_at TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    UNIQUE (location, office_id, service_id, start_at)
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL UNIQUE,
    p256dh TEXT NOT NULL,
    auth TEXT NOT NULL,
    services TEXT NOT NULL DEFAULT '[]',
    offices TEXT NOT NULL DEFAULT '[]',
    schedule_note TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true);
    Ok(SqlitePoolOptions::new().connect_with(options).await?)
}

/// Creates missing tables. The management interface owns real migrations;
/// this only guarantees a fresh database is usable.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// Deduplicating appointment persistence keyed by
/// `(location, office_id, service_id, start_at)`.
#[derive(Debug, Clone)]
pub struct AppointmentStore {
    pool: SqlitePool,
}

impl AppointmentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the candidates that are not already stored and returns exactly
    /// those, in encounter order. The whole batch commits in one transaction;
    /// a failure mid-batch rolls everything back, so a retried tick sees the
    /// identical pre-batch state. Calling this twice with the same candidate
    /// set yields an empty second result.
    pub async fn insert_new(
        &self,
        candidates: &[AppointmentCandidate],
    ) -> Result<Vec<Appointment>, StoreError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let fetched_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for candidate in candidates {
            // Sees rows staged earlier in this transaction, so duplicates
            // within one batch insert once.
            let existing: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM appointments
                 WHERE location = ? AND office_id = ? AND service_id = ? AND start_at = ?
                "#,
            )
            .bind(&candidate.location)
            .bind(candidate.office_id)
            .bind(candidate.service_id)
            .bind(candidate.start_at)
            .fetch_one(&mut *tx)
            .await?;

            if existing > 0 {
                continue;
            }

            let result = sqlx::query(
                r#"
                INSERT INTO appointments (location, office_id, service_id, start_at, fetched_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&candidate.location)
            .bind(candidate.office_id)
            .bind(candidate.service_id)
            .bind(candidate.start_at)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;

            inserted.push(Appointment {
                id: result.last_insert_rowid(),
                location: candidate.location.clone(),
                office_id: candidate.office_id,
                service_id: candidate.service_id,
                start_at: candidate.start_at,
                fetched_at,
            });
        }

        tx.commit().await?;
        debug!(
            candidates = candidates.len(),
            inserted = inserted.len(),
            "appointment batch committed"
        );
        Ok(inserted)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM appointments")
            .fetch_one(&self.pool)
            .await?)
    }
}

/// Read + targeted-delete access to subscriber records. Creation and update
/// belong to the external management interface; deleting a confirmed-dead
/// endpoint is the only mutation this process performs.
#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    pool: SqlitePool,
}

impl SubscriptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, endpoint, p256dh, auth, services, offices, schedule_note
              FROM subscriptions
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in rows {
            let services: BTreeSet<i64> = serde_json::from_str(&row.try_get::<String, _>("services")?)?;
            let offices: BTreeSet<i64> = serde_json::from_str(&row.try_get::<String, _>("offices")?)?;
            subscriptions.push(Subscription {
                id: row.try_get("id")?,
                endpoint: row.try_get("endpoint")?,
                p256dh: row.try_get("p256dh")?,
                auth: row.try_get("auth")?,
                services,
                offices,
                schedule_note: row.try_get("schedule_note")?,
            });
        }
        Ok(subscriptions)
    }

    /// Removes one record by endpoint; commits immediately. Returns whether a
    /// record was deleted, so a repeat call is a harmless no-op.
    pub async fn delete_by_endpoint(&self, endpoint: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
