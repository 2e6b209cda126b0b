//! Periodic progress reporting for long transfers.

use std::time::{Duration, Instant};

/// Minimum time between two progress reports.
const MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Counts work units and logs at most once per `MIN_INTERVAL` AND once per
/// `granularity` units, whichever is rarer.
pub(crate) struct Progress {
    label: &'static str,
    unit: &'static str,
    total: i64,
    done: i64,
    since_report: i64,
    granularity: i64,
    last_report: Instant,
}

impl Progress {
    pub fn new(label: &'static str, unit: &'static str, total: i64, granularity: i64) -> Self {
        Self {
            label,
            unit,
            total,
            done: 0,
            since_report: 0,
            granularity: granularity.max(1),
            last_report: Instant::now(),
        }
    }

    pub fn update(&mut self, units: i64) {
        self.done += units;
        self.since_report += units;
        if self.since_report >= self.granularity && self.last_report.elapsed() >= MIN_INTERVAL {
            self.report();
        }
    }

    fn report(&mut self) {
        tracing::info!(
            "{}: {}/{} {} complete",
            self.label,
            self.done,
            self.total,
            self.unit
        );
        self.since_report = 0;
        self.last_report = Instant::now();
    }

    pub fn finish(mut self) {
        self.report();
    }
}
