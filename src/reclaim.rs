//! Orphan reclamation.
//!
//! A window that leaves the floor without a closing scan leaves its last
//! interval open forever. The sweep closes every open interval older than
//! the policy's `max_open`, with a synthetic end time: the interval gets
//! credit for at most `max_open` of stay, never reaching closer than
//! `buffer` to the present, and never ending before it started.

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use tracing::info;

use crate::error::Result;
use crate::model::{ClosureReason, TrackingInterval};
use crate::store::IntervalStore;
use crate::telemetry::metrics;

/// Policy knobs for the sweep. The end-time formula is a heuristic
/// inherited from the floor operators, not a contract; both knobs are
/// runtime-configurable.
#[derive(Debug, Clone)]
pub struct OrphanPolicy {
    /// An interval open longer than this is an orphan.
    pub max_open: Duration,
    /// Synthetic end times stay at least this far before "now".
    pub buffer: Duration,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self {
            max_open: Duration::hours(24),
            buffer: Duration::hours(1),
        }
    }
}

impl OrphanPolicy {
    /// Synthetic end time for an orphan:
    /// `max(start, min(start + max_open, now - buffer))`.
    pub fn reclaimed_end_time(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        (start + self.max_open).min(now - self.buffer).max(start)
    }
}

/// Close every open interval that started before `now - max_open`.
/// Returns the reclaimed intervals' ids.
pub async fn reclaim_orphans<S: IntervalStore>(
    store: &S,
    policy: &OrphanPolicy,
) -> Result<Vec<i64>> {
    let now = Utc::now();
    let cutoff = now - policy.max_open;
    let stale = store.find_open_started_before(cutoff).await?;

    let mut reclaimed = Vec::with_capacity(stale.len());
    for interval in stale {
        let end_time = policy.reclaimed_end_time(interval.start_time, now);
        store
            .close(interval.id, end_time, ClosureReason::AutoClosedOrphaned)
            .await?;
        log_reclaimed(&interval, end_time);
        reclaimed.push(interval.id);
    }

    if !reclaimed.is_empty() {
        metrics::intervals_reclaimed().add(
            reclaimed.len() as u64,
            &[KeyValue::new("reason", "orphaned")],
        );
    }
    Ok(reclaimed)
}

fn log_reclaimed(interval: &TrackingInterval, end_time: DateTime<Utc>) {
    info!(
        interval_id = interval.id,
        workstation_id = interval.workstation_id,
        window = %interval.window,
        start_time = %interval.start_time,
        end_time = %end_time,
        "reclaimed orphaned interval"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, h, 0, 0).unwrap()
    }

    #[test]
    fn old_orphan_gets_a_full_day_of_stay() {
        let policy = OrphanPolicy::default();
        // Started three days before "now": start + 24h wins the clamp.
        let end = policy.reclaimed_end_time(at(1, 8), at(4, 8));
        assert_eq!(end, at(2, 8));
    }

    #[test]
    fn recent_orphan_is_clamped_behind_the_buffer() {
        let policy = OrphanPolicy::default();
        // Barely past max_open: now - 1h wins over start + 24h.
        let end = policy.reclaimed_end_time(at(1, 8), at(2, 8) + Duration::minutes(30));
        assert_eq!(end, at(2, 7) + Duration::minutes(30));
    }

    #[test]
    fn end_time_never_precedes_start() {
        // Degenerate policy where now - buffer lands before the start.
        let policy = OrphanPolicy {
            max_open: Duration::hours(1),
            buffer: Duration::hours(48),
        };
        let end = policy.reclaimed_end_time(at(3, 8), at(3, 10));
        assert_eq!(end, at(3, 8));
    }
}
