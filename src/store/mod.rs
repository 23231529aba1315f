//! Interval store backends.
//!
//! The engine talks to storage through [`IntervalStore`]. Production runs
//! on Postgres; the in-memory backend serializes commits behind a mutex
//! and backs the test suite and embedded deployments.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::TransitionPlan;
use crate::error::Result;
use crate::model::{ClosureReason, OverlapPair, TrackingInterval, WindowId};

pub use memory::MemIntervalStore;
pub use postgres::PgIntervalStore;

/// Persistence contract for tracking intervals.
///
/// The store is the sole authority over stored rows and the sole enforcer
/// of the open-row exclusivity invariants at commit time. Every backend
/// must refuse a [`commit_transition`](IntervalStore::commit_transition)
/// that would leave two open rows on one workstation or one window open in
/// two places.
#[async_trait]
pub trait IntervalStore: Send + Sync {
    /// Latest open interval at a workstation, by start time.
    ///
    /// At most one should exist; if storage already holds more (a partial
    /// failure got past the constraints) the query tolerates it, returns
    /// the latest, and logs the anomaly for operator attention.
    async fn find_open_by_workstation(
        &self,
        workstation_id: i32,
    ) -> Result<Option<TrackingInterval>>;

    /// Open interval for a window at any workstation other than
    /// `excluded_workstation_id`. Same anomaly tolerance as
    /// [`find_open_by_workstation`](IntervalStore::find_open_by_workstation).
    async fn find_open_by_window_elsewhere(
        &self,
        window: &WindowId,
        excluded_workstation_id: i32,
    ) -> Result<Option<TrackingInterval>>;

    /// Point lookup.
    async fn get(&self, interval_id: i64) -> Result<Option<TrackingInterval>>;

    /// Unconditional close. Overwrites end fields without re-validating
    /// invariants; errors with `NotFound` when the row does not exist.
    async fn close(
        &self,
        interval_id: i64,
        end_time: DateTime<Utc>,
        reason: ClosureReason,
    ) -> Result<()>;

    /// Open intervals whose stay began before `cutoff`, oldest first.
    /// Feed for the orphan sweep.
    async fn find_open_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TrackingInterval>>;

    /// Atomically execute a planned transition: close the planned
    /// intervals at the scan's start time, then insert the new open row.
    ///
    /// Fails with `ConcurrencyConflict` when a planned closure target is
    /// no longer open or the insert trips open-row exclusivity — either
    /// way a concurrent writer got there first and the caller should
    /// re-run the scan against current state.
    async fn commit_transition(&self, plan: &TransitionPlan) -> Result<TrackingInterval>;

    /// Every pair of same-workstation intervals with intersecting
    /// `[start, end_or_now)` ranges. Audit only.
    async fn detect_overlaps(&self) -> Result<Vec<OverlapPair>>;
}
