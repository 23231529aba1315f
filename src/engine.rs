//! Transition engine. The public API for recording scans.
//!
//! Every scan flows through [`Engine::record_scan`]: read the window's open
//! interval elsewhere, read the target workstation's open interval, decide
//! what to close, then commit the closures and the new open row through the
//! store in one atomic step. The engine is the sole writer; the store's
//! uniqueness constraint is the backstop for races between the reads and
//! the commit.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{ClosureReason, OverlapPair, ScanEvent, TrackingInterval};
use crate::store::IntervalStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// A closure the engine decided on while planning a scan.
#[derive(Debug, Clone)]
pub struct PlannedClosure {
    pub interval: TrackingInterval,
    pub reason: ClosureReason,
}

/// Everything a scan will write: zero or more closures, then the open row.
/// Built from a consistent read of current state; the store commits it
/// atomically and rejects it if the state moved underneath.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    pub scan: ScanEvent,
    pub closures: Vec<PlannedClosure>,
}

/// The tracking engine. Owns the store handle; holds no other state.
pub struct Engine<S> {
    store: S,
}

impl<S: IntervalStore> Engine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store, for audit tooling and the orphan sweep.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a scan event, opening a tracking interval at the target
    /// workstation.
    ///
    /// Closes the window's previous interval (chain transition) or a
    /// duplicate stay at the same workstation (rescan) as a side effect.
    /// Fails with [`Error::Conflict`] when a different window occupies the
    /// target, with nothing written. Fails with
    /// [`Error::ConcurrencyConflict`] when a concurrent scan won the race;
    /// retrying re-reads current state and is always safe.
    pub async fn record_scan(&self, scan: ScanEvent) -> Result<TrackingInterval> {
        validate_scan(&scan)?;
        let started = std::time::Instant::now();

        let open_elsewhere = self
            .store
            .find_open_by_window_elsewhere(&scan.window, scan.workstation_id)
            .await?;
        let open_at_target = self.store.find_open_by_workstation(scan.workstation_id).await?;

        let plan = match plan_transition(scan, open_elsewhere, open_at_target) {
            Ok(plan) => plan,
            Err(err) => {
                if let Error::Conflict {
                    workstation_id,
                    occupant,
                    interval_id,
                    ..
                } = &err
                {
                    warn!(
                        workstation_id,
                        occupant = %occupant,
                        interval_id,
                        "scan rejected, workstation occupied by a different window"
                    );
                    metrics::scans_rejected().add(1, &[KeyValue::new("kind", "occupied")]);
                }
                return Err(err);
            }
        };

        for closure in &plan.closures {
            info!(
                interval_id = closure.interval.id,
                workstation_id = closure.interval.workstation_id,
                window = %closure.interval.window,
                reason = %closure.reason,
                end_time = %plan.scan.start_time,
                "closing interval"
            );
        }

        let interval = match self.store.commit_transition(&plan).await {
            Ok(interval) => interval,
            Err(err @ Error::ConcurrencyConflict { .. }) => {
                metrics::scans_rejected().add(1, &[KeyValue::new("kind", "race")]);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let decision = match plan.closures.first().map(|c| c.reason) {
            None => "open",
            Some(ClosureReason::ChainTransition) => "chain",
            Some(_) => "rescan",
        };
        info!(
            interval_id = interval.id,
            workstation_id = interval.workstation_id,
            window = %interval.window,
            start_time = %interval.start_time,
            decision,
            "scan opened interval"
        );
        metrics::scans_recorded().add(1, &[KeyValue::new("decision", decision.to_string())]);
        metrics::scan_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("decision", decision.to_string())],
        );

        Ok(interval)
    }

    /// Close an interval unconditionally.
    ///
    /// Used by operators resolving a genuine conflict and by the orphan
    /// sweep. Does not re-check the tracking invariants; callers are
    /// responsible for only closing truly-open, truly-stale intervals.
    pub async fn close_interval(
        &self,
        interval_id: i64,
        end_time: DateTime<Utc>,
        reason: ClosureReason,
    ) -> Result<()> {
        self.store.close(interval_id, end_time, reason).await?;
        info!(interval_id, end_time = %end_time, reason = %reason, "interval closed");
        Ok(())
    }

    /// Point lookup of one interval.
    pub async fn get_interval(&self, interval_id: i64) -> Result<TrackingInterval> {
        self.store
            .get(interval_id)
            .await?
            .ok_or(Error::NotFound(interval_id))
    }

    /// Audit query: same-workstation interval pairs with intersecting time
    /// ranges. Never consulted by the scan path; a non-empty result means
    /// the engine was bypassed or has a bug.
    pub async fn detect_overlaps(&self) -> Result<Vec<OverlapPair>> {
        let pairs = self.store.detect_overlaps().await?;
        if !pairs.is_empty() {
            warn!(pairs = pairs.len(), "overlap audit found intersecting intervals");
        }
        Ok(pairs)
    }
}

fn validate_scan(scan: &ScanEvent) -> Result<()> {
    if scan.window.lote.trim().is_empty() {
        return Err(Error::Validation("lote must be non-empty".into()));
    }
    if scan.window.instancia < 0 || scan.window.version < 0 {
        return Err(Error::Validation(format!(
            "instancia and version must be non-negative, got {}",
            scan.window
        )));
    }
    if scan.workstation_id <= 0 {
        return Err(Error::Validation(format!(
            "workstation id must be positive, got {}",
            scan.workstation_id
        )));
    }
    Ok(())
}

/// Decide what a scan does, from a consistent read of current state.
///
/// `open_elsewhere` is the window's open interval at any other workstation
/// (chain candidate, closed first); `open_at_target` is whatever currently
/// occupies the target workstation. Both closures can only appear together
/// when the stored state already violates the single-location invariant;
/// the sequential close order tolerates that corruption instead of
/// compounding it.
pub fn plan_transition(
    scan: ScanEvent,
    open_elsewhere: Option<TrackingInterval>,
    open_at_target: Option<TrackingInterval>,
) -> Result<TransitionPlan> {
    let mut closures = Vec::new();

    if let Some(previous) = open_elsewhere {
        ensure_closable(&scan, &previous)?;
        closures.push(PlannedClosure {
            interval: previous,
            reason: ClosureReason::ChainTransition,
        });
    }

    if let Some(occupant) = open_at_target {
        if occupant.window == scan.window {
            ensure_closable(&scan, &occupant)?;
            closures.push(PlannedClosure {
                interval: occupant,
                reason: ClosureReason::RescannedSameWindow,
            });
        } else {
            return Err(Error::Conflict {
                workstation_id: scan.workstation_id,
                occupant: occupant.window,
                interval_id: occupant.id,
                since: occupant.start_time,
            });
        }
    }

    Ok(TransitionPlan { scan, closures })
}

/// Closing an interval at the scan's start time must not produce a
/// negative stay.
fn ensure_closable(scan: &ScanEvent, target: &TrackingInterval) -> Result<()> {
    if scan.start_time < target.start_time {
        return Err(Error::Validation(format!(
            "scan at {} predates open interval {} started {}",
            scan.start_time, target.id, target.start_time
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WindowId;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, 0).unwrap()
    }

    fn win(lote: &str) -> WindowId {
        WindowId::new(lote, 1, 1)
    }

    fn open_interval(id: i64, workstation_id: i32, window: WindowId, h: u32) -> TrackingInterval {
        TrackingInterval {
            id,
            workstation_id,
            window,
            start_time: at(h, 0),
            end_time: None,
            closure_reason: None,
            recorded_by: None,
            created_at: at(h, 0),
            updated_at: at(h, 0),
        }
    }

    #[test]
    fn fresh_scan_plans_no_closures() {
        let plan = plan_transition(ScanEvent::new(win("A"), 2, at(10, 0)), None, None).unwrap();
        assert!(plan.closures.is_empty());
    }

    #[test]
    fn chain_scan_closes_previous_workstation() {
        let previous = open_interval(7, 1, win("A"), 9);
        let plan = plan_transition(
            ScanEvent::new(win("A"), 2, at(10, 0)),
            Some(previous),
            None,
        )
        .unwrap();

        assert_eq!(plan.closures.len(), 1);
        assert_eq!(plan.closures[0].interval.id, 7);
        assert_eq!(plan.closures[0].reason, ClosureReason::ChainTransition);
    }

    #[test]
    fn rescan_closes_same_workstation_stay() {
        let current = open_interval(7, 2, win("A"), 9);
        let plan = plan_transition(
            ScanEvent::new(win("A"), 2, at(10, 0)),
            None,
            Some(current),
        )
        .unwrap();

        assert_eq!(plan.closures.len(), 1);
        assert_eq!(plan.closures[0].reason, ClosureReason::RescannedSameWindow);
    }

    #[test]
    fn occupied_workstation_rejects_with_occupant_details() {
        let occupant = open_interval(7, 2, win("B"), 9);
        let err = plan_transition(
            ScanEvent::new(win("A"), 2, at(10, 0)),
            None,
            Some(occupant),
        )
        .unwrap_err();

        match err {
            Error::Conflict {
                workstation_id,
                occupant,
                interval_id,
                since,
            } => {
                assert_eq!(workstation_id, 2);
                assert_eq!(occupant, win("B"));
                assert_eq!(interval_id, 7);
                assert_eq!(since, at(9, 0));
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn conflict_wins_even_when_chain_close_was_possible() {
        // Window A open at 1, scans into 2 which B occupies: reject, and
        // the plan never materializes, so A's interval at 1 stays open.
        let elsewhere = open_interval(7, 1, win("A"), 9);
        let occupant = open_interval(8, 2, win("B"), 9);
        let err = plan_transition(
            ScanEvent::new(win("A"), 2, at(10, 0)),
            Some(elsewhere),
            Some(occupant),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn scan_predating_open_interval_is_invalid() {
        let previous = open_interval(7, 1, win("A"), 11);
        let err = plan_transition(
            ScanEvent::new(win("A"), 2, at(10, 0)),
            Some(previous),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn corrupted_double_open_closes_both() {
        // Single-location invariant already broken in storage: the window
        // is open at workstation 1 and at the target 2. The plan closes
        // both rather than leaving a stray open row behind.
        let elsewhere = open_interval(7, 1, win("A"), 8);
        let duplicate = open_interval(8, 2, win("A"), 9);
        let plan = plan_transition(
            ScanEvent::new(win("A"), 2, at(10, 0)),
            Some(elsewhere),
            Some(duplicate),
        )
        .unwrap();

        assert_eq!(plan.closures.len(), 2);
        assert_eq!(plan.closures[0].reason, ClosureReason::ChainTransition);
        assert_eq!(plan.closures[1].reason, ClosureReason::RescannedSameWindow);
    }

    #[test]
    fn malformed_inputs_fail_validation() {
        assert!(matches!(
            validate_scan(&ScanEvent::new(WindowId::new("  ", 1, 1), 2, at(10, 0))),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_scan(&ScanEvent::new(WindowId::new("A", -1, 1), 2, at(10, 0))),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_scan(&ScanEvent::new(win("A"), 0, at(10, 0))),
            Err(Error::Validation(_))
        ));
    }
}
