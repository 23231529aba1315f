//! Core data model.
//!
//! A window is a physical unit of work identified by (lote, instancia,
//! version). A tracking interval is the time range a window spent at one
//! workstation. At any instant a window occupies at most one workstation
//! and a workstation holds at most one window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Window identity
// ---------------------------------------------------------------------------

/// Composite identity of a physical window. Immutable once scanned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId {
    /// Batch label, e.g. "L2024-117".
    pub lote: String,
    /// Instance number within the batch.
    pub instancia: i32,
    /// Version of the instance (reworks bump this).
    pub version: i32,
}

impl WindowId {
    pub fn new(lote: impl Into<String>, instancia: i32, version: i32) -> Self {
        Self {
            lote: lote.into(),
            instancia,
            version,
        }
    }
}

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.lote, self.instancia, self.version)
    }
}

// ---------------------------------------------------------------------------
// Tracking interval
// ---------------------------------------------------------------------------

/// One stay of a window at a workstation. Created open by the engine,
/// closed exactly once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingInterval {
    /// Surrogate key, assigned by the store.
    pub id: i64,

    /// Where the interval occurred.
    pub workstation_id: i32,

    /// Which unit.
    pub window: WindowId,

    /// Scan-in time. Immutable after creation.
    pub start_time: DateTime<Utc>,

    /// Scan-out time. None while the interval is open.
    pub end_time: Option<DateTime<Utc>>,

    /// Why the interval closed. Set exactly when end_time is set.
    pub closure_reason: Option<ClosureReason>,

    /// Optional actor attached at scan time, for audit.
    pub recorded_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackingInterval {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

// ---------------------------------------------------------------------------
// Closure reason
// ---------------------------------------------------------------------------

/// How an interval went from open to closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    /// The window was scanned at a different workstation; it left this one
    /// the instant the new scan arrived.
    ChainTransition,
    /// The same window was scanned again at the same workstation; the old
    /// stay collapses into a fresh one.
    RescannedSameWindow,
    /// An operator closed the interval by hand.
    ManualClose,
    /// Reclaimed by the orphan sweep after staying open too long.
    AutoClosedOrphaned,
}

impl std::fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClosureReason::ChainTransition => "chain_transition",
            ClosureReason::RescannedSameWindow => "rescanned_same_window",
            ClosureReason::ManualClose => "manual_close",
            ClosureReason::AutoClosedOrphaned => "auto_closed_orphaned",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ClosureReason {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chain_transition" => Ok(ClosureReason::ChainTransition),
            "rescanned_same_window" => Ok(ClosureReason::RescannedSameWindow),
            "manual_close" => Ok(ClosureReason::ManualClose),
            "auto_closed_orphaned" => Ok(ClosureReason::AutoClosedOrphaned),
            _ => Err(crate::error::Error::Internal(format!(
                "unknown closure reason: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Scan event
// ---------------------------------------------------------------------------

/// An incoming scan. The engine's public input for opening intervals.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub window: WindowId,
    pub workstation_id: i32,
    pub start_time: DateTime<Utc>,
    pub recorded_by: Option<String>,
}

impl ScanEvent {
    pub fn new(window: WindowId, workstation_id: i32, start_time: DateTime<Utc>) -> Self {
        Self {
            window,
            workstation_id,
            start_time,
            recorded_by: None,
        }
    }

    pub fn recorded_by(mut self, actor: impl Into<String>) -> Self {
        self.recorded_by = Some(actor.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Overlap audit
// ---------------------------------------------------------------------------

/// Two same-workstation intervals whose time ranges intersect.
///
/// A non-empty overlap report always means the engine was bypassed or has
/// a bug; the engine itself never consumes this.
#[derive(Debug, Clone, Serialize)]
pub struct OverlapPair {
    pub first: TrackingInterval,
    pub second: TrackingInterval,
    pub overlap_secs: i64,
}

/// Seconds of intersection between two intervals' `[start, end_or_now)`
/// ranges, if any. Open ends are extended to `now`.
pub fn overlap_secs(a: &TrackingInterval, b: &TrackingInterval, now: DateTime<Utc>) -> Option<i64> {
    let a_end = a.end_time.unwrap_or(now);
    let b_end = b.end_time.unwrap_or(now);
    let start = a.start_time.max(b.start_time);
    let end = a_end.min(b_end);
    let secs = (end - start).num_seconds();
    (secs > 0).then_some(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn interval(start_h: u32, end_h: Option<u32>) -> TrackingInterval {
        let at = |h| Utc.with_ymd_and_hms(2024, 5, 10, h, 0, 0).unwrap();
        TrackingInterval {
            id: 1,
            workstation_id: 1,
            window: WindowId::new("L1", 1, 1),
            start_time: at(start_h),
            end_time: end_h.map(at),
            closure_reason: end_h.map(|_| ClosureReason::ManualClose),
            recorded_by: None,
            created_at: at(start_h),
            updated_at: at(start_h),
        }
    }

    #[test]
    fn closure_reason_round_trips_through_text() {
        for reason in [
            ClosureReason::ChainTransition,
            ClosureReason::RescannedSameWindow,
            ClosureReason::ManualClose,
            ClosureReason::AutoClosedOrphaned,
        ] {
            let parsed: ClosureReason = reason.to_string().parse().unwrap();
            assert_eq!(parsed, reason);
        }
        assert!("left_in_truck".parse::<ClosureReason>().is_err());
    }

    #[test]
    fn adjacent_intervals_do_not_overlap() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 23, 0, 0).unwrap();
        let a = interval(9, Some(10));
        let b = interval(10, Some(11));
        assert_eq!(overlap_secs(&a, &b, now), None);
    }

    #[test]
    fn open_interval_overlaps_up_to_now() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let a = interval(9, None);
        let b = interval(10, Some(11));
        assert_eq!(overlap_secs(&a, &b, now), Some(3600));
    }

    #[test]
    fn disjoint_intervals_do_not_overlap() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 23, 0, 0).unwrap();
        let a = interval(9, Some(10));
        let b = interval(14, Some(15));
        assert_eq!(overlap_secs(&a, &b, now), None);
        assert_eq!(overlap_secs(&b, &a, now), None);
    }
}
