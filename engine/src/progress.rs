//! Progress reporting.
//!
//! The ProgressCallback trait decouples the engine from any specific front-end
//! (CLI, worker channel, tests). ProgressReporter turns raw byte counts into
//! throughput and a remaining-time estimate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::conflict::ConflictQuery;
use crate::error::{ErrorQuery, ErrorRecord};
use crate::model::{JobDescriptor, JobSummary, JobTotals, TransferUnit};

/// Receives notifications while a job runs.
///
/// All methods are called synchronously on the thread driving the job and
/// default to doing nothing.
pub trait ProgressCallback: Send {
    /// Called after every job state transition.
    fn on_state_changed(&self, _job: &JobDescriptor) {}

    /// Called when a unit is about to be processed.
    fn on_unit_started(&self, _job: &JobDescriptor, _unit: &TransferUnit) {}

    /// Called between chunks, at most once per progress interval.
    fn on_progress(&self, _job: &JobDescriptor, _snapshot: &ProgressSnapshot) {}

    /// Called when a unit reached a terminal status.
    fn on_unit_finished(&self, _job: &JobDescriptor, _unit: &TransferUnit) {}

    /// Called for every appended error record.
    fn on_error(&self, _job: &JobDescriptor, _record: &ErrorRecord) {}

    /// Called when the job suspends for a conflict decision.
    fn on_conflict(&self, _job: &JobDescriptor, _query: &ConflictQuery) {}

    /// Called when the job suspends on a failed unit under the ask policy.
    fn on_error_decision(&self, _job: &JobDescriptor, _query: &ErrorQuery) {}

    /// Called once the job reached a terminal state.
    fn on_job_completed(&self, _summary: &JobSummary) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub done_bytes: u64,
    pub planned_bytes: u64,
    pub done_items: u64,
    pub planned_items: u64,
    /// Bytes per second over the sliding window
    pub throughput: f64,
    pub remaining_secs: Option<u64>,
    /// `remaining_secs` formatted for display, or "unknown"
    pub remaining_text: String,
}

pub struct ProgressReporter {
    window: Duration,
    interval: Duration,
    /// (time, cumulative bytes); the front sample may lie outside the window
    samples: VecDeque<(Instant, u64)>,
    recorded: u64,
    last_emit: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(window: Duration, interval: Duration) -> Self {
        let mut reporter = ProgressReporter {
            window,
            interval,
            samples: VecDeque::new(),
            recorded: 0,
            last_emit: None,
        };
        reporter.reset_window_at(Instant::now());
        reporter
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, now: Instant, bytes: u64) {
        self.recorded = self.recorded.saturating_add(bytes);
        self.samples.push_back((now, self.recorded));
        if let Some(cutoff) = now.checked_sub(self.window) {
            while self.samples.len() > 2 && self.samples[1].0 <= cutoff {
                self.samples.pop_front();
            }
        }
    }

    /// Forget the window, e.g. after a pause.
    pub fn reset_window(&mut self) {
        self.reset_window_at(Instant::now());
    }

    pub fn reset_window_at(&mut self, now: Instant) {
        self.samples.clear();
        self.samples.push_back((now, self.recorded));
    }

    /// Bytes per second; zero until two samples span a measurable interval.
    pub fn throughput(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.0.saturating_duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (last.1 - first.1) as f64 / elapsed
    }

    /// Estimated seconds left, `None` while throughput is zero.
    pub fn remaining(&self, totals: &JobTotals) -> Option<u64> {
        let left = totals.remaining_bytes();
        if left == 0 {
            return Some(0);
        }
        let rate = self.throughput();
        if rate <= 0.0 {
            return None;
        }
        Some((left as f64 / rate).ceil() as u64)
    }

    pub fn snapshot(&self, totals: &JobTotals) -> ProgressSnapshot {
        let remaining_secs = self.remaining(totals);
        ProgressSnapshot {
            done_bytes: totals.done_bytes,
            planned_bytes: totals.planned_bytes,
            done_items: totals.done_items,
            planned_items: totals.planned_items,
            throughput: self.throughput(),
            remaining_secs,
            remaining_text: remaining_secs
                .map(format_remaining)
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Rate limiter for notifications.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

/// Format a remaining-time estimate.
///
/// ```
/// use filejob_engine::progress::format_remaining;
/// assert_eq!(format_remaining(125), "2 m 5 s");
/// ```
pub fn format_remaining(secs: u64) -> String {
    let seconds = secs % 60;
    let minutes = secs / 60 % 60;
    let hours = secs / 3600 % 24;
    let days = secs / 86_400;

    if days > 0 {
        format!("{} d {} h {} m {} s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{} h {} m {} s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{} m {} s", minutes, seconds)
    } else {
        format!("{} s", seconds)
    }
}
