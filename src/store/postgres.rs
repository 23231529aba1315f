//! Postgres interval store.
//!
//! Open-row exclusivity lives in two partial unique indexes
//! (`ux_open_workstation`, `ux_open_window`); a scan that loses the race
//! between the engine's reads and its insert hits one of them and is
//! surfaced as a retryable `ConcurrencyConflict`. Everything else is
//! plain parameterized SQL over a shared connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::warn;

use crate::engine::TransitionPlan;
use crate::error::{Error, Result};
use crate::model::{ClosureReason, OverlapPair, TrackingInterval, WindowId};
use crate::store::IntervalStore;

const INTERVAL_COLUMNS: &str = "id, workstation_id, lote, instancia, version, \
     start_time, end_time, closure_reason, recorded_by, created_at, updated_at";

/// Postgres-backed store. Owns the connection pool.
pub struct PgIntervalStore {
    pool: PgPool,
}

impl PgIntervalStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl IntervalStore for PgIntervalStore {
    async fn find_open_by_workstation(
        &self,
        workstation_id: i32,
    ) -> Result<Option<TrackingInterval>> {
        let rows: Vec<IntervalRow> = sqlx::query_as(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM tracking_intervals
             WHERE workstation_id = $1 AND end_time IS NULL
             ORDER BY start_time DESC LIMIT 2"
        ))
        .bind(workstation_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            warn!(
                workstation_id,
                "multiple open intervals at one workstation, using the latest"
            );
        }
        rows.into_iter().next().map(IntervalRow::try_into_interval).transpose()
    }

    async fn find_open_by_window_elsewhere(
        &self,
        window: &WindowId,
        excluded_workstation_id: i32,
    ) -> Result<Option<TrackingInterval>> {
        let rows: Vec<IntervalRow> = sqlx::query_as(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM tracking_intervals
             WHERE lote = $1 AND instancia = $2 AND version = $3
             AND workstation_id <> $4 AND end_time IS NULL
             ORDER BY start_time DESC LIMIT 2"
        ))
        .bind(&window.lote)
        .bind(window.instancia)
        .bind(window.version)
        .bind(excluded_workstation_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            warn!(
                window = %window,
                "window is open at multiple workstations, using the latest"
            );
        }
        rows.into_iter().next().map(IntervalRow::try_into_interval).transpose()
    }

    async fn get(&self, interval_id: i64) -> Result<Option<TrackingInterval>> {
        let row: Option<IntervalRow> = sqlx::query_as(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM tracking_intervals WHERE id = $1"
        ))
        .bind(interval_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IntervalRow::try_into_interval).transpose()
    }

    async fn close(
        &self,
        interval_id: i64,
        end_time: DateTime<Utc>,
        reason: ClosureReason,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE tracking_intervals
             SET end_time = $1, closure_reason = $2, updated_at = now()
             WHERE id = $3",
        )
        .bind(end_time)
        .bind(reason.to_string())
        .bind(interval_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected_constraint_to_internal)?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(interval_id));
        }
        Ok(())
    }

    async fn find_open_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TrackingInterval>> {
        let rows: Vec<IntervalRow> = sqlx::query_as(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM tracking_intervals
             WHERE end_time IS NULL AND start_time < $1
             ORDER BY start_time ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IntervalRow::try_into_interval).collect()
    }

    async fn commit_transition(&self, plan: &TransitionPlan) -> Result<TrackingInterval> {
        let mut tx = self.pool.begin().await?;
        let scan = &plan.scan;

        for closure in &plan.closures {
            // The guard on end_time makes a lost race visible: if another
            // scan already closed this row, zero rows match.
            let rows_affected = sqlx::query(
                "UPDATE tracking_intervals
                 SET end_time = $1, closure_reason = $2, updated_at = now()
                 WHERE id = $3 AND end_time IS NULL",
            )
            .bind(scan.start_time)
            .bind(closure.reason.to_string())
            .bind(closure.interval.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows_affected == 0 {
                return Err(Error::ConcurrencyConflict {
                    workstation_id: scan.workstation_id,
                });
            }
        }

        let inserted: std::result::Result<IntervalRow, sqlx::Error> = sqlx::query_as(&format!(
            "INSERT INTO tracking_intervals
                 (workstation_id, lote, instancia, version, start_time, recorded_by)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {INTERVAL_COLUMNS}"
        ))
        .bind(scan.workstation_id)
        .bind(&scan.window.lote)
        .bind(scan.window.instancia)
        .bind(scan.window.version)
        .bind(scan.start_time)
        .bind(&scan.recorded_by)
        .fetch_one(&mut *tx)
        .await;

        let row = inserted.map_err(|e| classify_insert_error(e, scan.workstation_id))?;
        tx.commit().await?;
        row.try_into_interval()
    }

    async fn detect_overlaps(&self) -> Result<Vec<OverlapPair>> {
        let rows = sqlx::query(
            "SELECT
                 a.id AS a_id, a.workstation_id AS a_workstation_id,
                 a.lote AS a_lote, a.instancia AS a_instancia, a.version AS a_version,
                 a.start_time AS a_start_time, a.end_time AS a_end_time,
                 a.closure_reason AS a_closure_reason, a.recorded_by AS a_recorded_by,
                 a.created_at AS a_created_at, a.updated_at AS a_updated_at,
                 b.id AS b_id, b.workstation_id AS b_workstation_id,
                 b.lote AS b_lote, b.instancia AS b_instancia, b.version AS b_version,
                 b.start_time AS b_start_time, b.end_time AS b_end_time,
                 b.closure_reason AS b_closure_reason, b.recorded_by AS b_recorded_by,
                 b.created_at AS b_created_at, b.updated_at AS b_updated_at,
                 EXTRACT(EPOCH FROM (
                     LEAST(COALESCE(a.end_time, now()), COALESCE(b.end_time, now()))
                     - GREATEST(a.start_time, b.start_time)
                 ))::BIGINT AS overlap_secs
             FROM tracking_intervals a
             JOIN tracking_intervals b
               ON a.workstation_id = b.workstation_id AND a.id < b.id
             WHERE GREATEST(a.start_time, b.start_time)
                 < LEAST(COALESCE(a.end_time, now()), COALESCE(b.end_time, now()))
             ORDER BY a.workstation_id, a.start_time",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OverlapPair {
                    first: interval_from_prefixed_row(row, "a_")?,
                    second: interval_from_prefixed_row(row, "b_")?,
                    overlap_secs: row.try_get("overlap_secs")?,
                })
            })
            .collect()
    }
}

/// Map the insert's failure mode: a unique violation on the open-row
/// indexes is the anticipated race, anything else constraint-shaped means
/// the engine's read-then-write logic missed a case.
fn classify_insert_error(e: sqlx::Error, workstation_id: i32) -> Error {
    match &e {
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation => {
                Error::ConcurrencyConflict { workstation_id }
            }
            sqlx::error::ErrorKind::CheckViolation => {
                Error::Internal(format!("insert violated a check constraint: {db}"))
            }
            _ => Error::Storage(e),
        },
        _ => Error::Storage(e),
    }
}

/// Constraint violations outside the anticipated race window are engine
/// bugs, not storage weather.
fn unexpected_constraint_to_internal(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::CheckViolation => {
                Error::Internal(format!("unexpected constraint violation: {db}"))
            }
            _ => Error::Storage(e),
        },
        _ => Error::Storage(e),
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct IntervalRow {
    id: i64,
    workstation_id: i32,
    lote: String,
    instancia: i32,
    version: i32,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    closure_reason: Option<String>,
    recorded_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IntervalRow {
    fn try_into_interval(self) -> Result<TrackingInterval> {
        Ok(TrackingInterval {
            id: self.id,
            workstation_id: self.workstation_id,
            window: WindowId::new(self.lote, self.instancia, self.version),
            start_time: self.start_time,
            end_time: self.end_time,
            closure_reason: self.closure_reason.as_deref().map(str::parse).transpose()?,
            recorded_by: self.recorded_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn interval_from_prefixed_row(row: &PgRow, prefix: &str) -> Result<TrackingInterval> {
    let col = |name: &str| format!("{prefix}{name}");
    let closure_reason: Option<String> = row.try_get(col("closure_reason").as_str())?;
    Ok(TrackingInterval {
        id: row.try_get(col("id").as_str())?,
        workstation_id: row.try_get(col("workstation_id").as_str())?,
        window: WindowId::new(
            row.try_get::<String, _>(col("lote").as_str())?,
            row.try_get(col("instancia").as_str())?,
            row.try_get(col("version").as_str())?,
        ),
        start_time: row.try_get(col("start_time").as_str())?,
        end_time: row.try_get(col("end_time").as_str())?,
        closure_reason: closure_reason.as_deref().map(str::parse).transpose()?,
        recorded_by: row.try_get(col("recorded_by").as_str())?,
        created_at: row.try_get(col("created_at").as_str())?,
        updated_at: row.try_get(col("updated_at").as_str())?,
    })
}
