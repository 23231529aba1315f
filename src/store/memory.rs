//! In-memory interval store.
//!
//! All state sits behind one async mutex; a commit holds the lock for its
//! whole read-check-write sequence, which is the embedded-store equivalent
//! of the Postgres transaction plus partial unique indexes. Backs the test
//! suite and single-process deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::engine::TransitionPlan;
use crate::error::{Error, Result};
use crate::model::{ClosureReason, OverlapPair, TrackingInterval, WindowId, overlap_secs};
use crate::store::IntervalStore;

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, TrackingInterval>,
}

impl Inner {
    fn latest_open(
        &self,
        mut matches: impl FnMut(&TrackingInterval) -> bool,
    ) -> (usize, Option<&TrackingInterval>) {
        let mut count = 0;
        let mut latest: Option<&TrackingInterval> = None;
        for row in self.rows.values() {
            if row.is_open() && matches(row) {
                count += 1;
                if latest.is_none_or(|best| row.start_time > best.start_time) {
                    latest = Some(row);
                }
            }
        }
        (count, latest)
    }
}

/// Mutex-backed store for tests and embedded use.
#[derive(Default)]
pub struct MemIntervalStore {
    inner: Mutex<Inner>,
}

impl MemIntervalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntervalStore for MemIntervalStore {
    async fn find_open_by_workstation(
        &self,
        workstation_id: i32,
    ) -> Result<Option<TrackingInterval>> {
        let inner = self.inner.lock().await;
        let (count, latest) = inner.latest_open(|row| row.workstation_id == workstation_id);
        if count > 1 {
            warn!(
                workstation_id,
                count, "multiple open intervals at one workstation, using the latest"
            );
        }
        Ok(latest.cloned())
    }

    async fn find_open_by_window_elsewhere(
        &self,
        window: &WindowId,
        excluded_workstation_id: i32,
    ) -> Result<Option<TrackingInterval>> {
        let inner = self.inner.lock().await;
        let (count, latest) = inner.latest_open(|row| {
            row.window == *window && row.workstation_id != excluded_workstation_id
        });
        if count > 1 {
            warn!(
                window = %window,
                count, "window is open at multiple workstations, using the latest"
            );
        }
        Ok(latest.cloned())
    }

    async fn get(&self, interval_id: i64) -> Result<Option<TrackingInterval>> {
        Ok(self.inner.lock().await.rows.get(&interval_id).cloned())
    }

    async fn close(
        &self,
        interval_id: i64,
        end_time: DateTime<Utc>,
        reason: ClosureReason,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .get_mut(&interval_id)
            .ok_or(Error::NotFound(interval_id))?;
        row.end_time = Some(end_time);
        row.closure_reason = Some(reason);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn find_open_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TrackingInterval>> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<TrackingInterval> = inner
            .rows
            .values()
            .filter(|row| row.is_open() && row.start_time < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|row| row.start_time);
        Ok(stale)
    }

    async fn commit_transition(&self, plan: &TransitionPlan) -> Result<TrackingInterval> {
        let mut inner = self.inner.lock().await;
        let scan = &plan.scan;
        let race_lost = || Error::ConcurrencyConflict {
            workstation_id: scan.workstation_id,
        };

        // A planned closure target that is gone or already closed means a
        // concurrent scan got there between our reads and this commit.
        for closure in &plan.closures {
            match inner.rows.get(&closure.interval.id) {
                Some(row) if row.is_open() => {}
                _ => return Err(race_lost()),
            }
        }

        // Same exclusivity checks the Postgres partial unique indexes
        // perform, re-run under the lock against current state.
        let closing: Vec<i64> = plan.closures.iter().map(|c| c.interval.id).collect();
        let occupied = inner.rows.values().any(|row| {
            row.is_open()
                && !closing.contains(&row.id)
                && (row.workstation_id == scan.workstation_id || row.window == scan.window)
        });
        if occupied {
            return Err(race_lost());
        }

        let now = Utc::now();
        for closure in &plan.closures {
            let row = inner
                .rows
                .get_mut(&closure.interval.id)
                .expect("closure target checked above");
            row.end_time = Some(scan.start_time);
            row.closure_reason = Some(closure.reason);
            row.updated_at = now;
        }

        inner.next_id += 1;
        let interval = TrackingInterval {
            id: inner.next_id,
            workstation_id: scan.workstation_id,
            window: scan.window.clone(),
            start_time: scan.start_time,
            end_time: None,
            closure_reason: None,
            recorded_by: scan.recorded_by.clone(),
            created_at: now,
            updated_at: now,
        };
        inner.rows.insert(interval.id, interval.clone());
        Ok(interval)
    }

    async fn detect_overlaps(&self) -> Result<Vec<OverlapPair>> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let rows: Vec<&TrackingInterval> = inner.rows.values().collect();

        let mut pairs = Vec::new();
        for (i, a) in rows.iter().enumerate() {
            for b in rows.iter().skip(i + 1) {
                if a.workstation_id != b.workstation_id {
                    continue;
                }
                if let Some(secs) = overlap_secs(a, b, now) {
                    pairs.push(OverlapPair {
                        first: (*a).clone(),
                        second: (*b).clone(),
                        overlap_secs: secs,
                    });
                }
            }
        }
        Ok(pairs)
    }
}
