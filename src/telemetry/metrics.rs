//! Metric instrument factories for wintrack.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"wintrack"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for wintrack instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("wintrack")
}

/// Counter: scans that opened an interval.
/// Labels: `decision` ("open" | "chain" | "rescan").
pub fn scans_recorded() -> Counter<u64> {
    meter()
        .u64_counter("wintrack.scans.recorded")
        .with_description("Scans that opened a tracking interval")
        .build()
}

/// Counter: scans the engine refused.
/// Labels: `kind` ("occupied" | "race").
pub fn scans_rejected() -> Counter<u64> {
    meter()
        .u64_counter("wintrack.scans.rejected")
        .with_description("Scans rejected by the transition engine")
        .build()
}

/// Counter: intervals closed by the orphan sweep.
/// Labels: `reason`.
pub fn intervals_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("wintrack.intervals.reclaimed")
        .with_description("Open intervals closed by the orphan sweep")
        .build()
}

/// Histogram: end-to-end record_scan duration in milliseconds.
/// Labels: `decision`.
pub fn scan_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("wintrack.scan.duration_ms")
        .with_description("record_scan duration in milliseconds")
        .with_unit("ms")
        .build()
}
