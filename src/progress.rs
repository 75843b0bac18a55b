use crate::checkpoint::CheckpointCounters;
use crate::outcome::Outcome;
use crate::work_unit::WorkKey;
use std::fmt;
use std::time::{Duration, Instant};

/// Counters scoped to this invocation. Cumulative totals live in the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProgress {
    /// Successes this run. Drives checkpoint saves.
    pub processed_this_run: u64,
    pub failed_this_run: u64,
    /// `processed_this_run` at the last save.
    pub last_checkpoint_mark: u64,
    /// `attempted()` at the last progress line.
    pub last_report_mark: u64,
}

impl RunProgress {
    pub fn attempted(&self) -> u64 {
        self.processed_this_run + self.failed_this_run
    }

    /// Threshold crossing, not an exact multiple: batches advance the counter by more
    /// than one, so `processed % interval == 0` can be stepped over forever.
    pub fn checkpoint_due(&self, interval: u64) -> bool {
        self.processed_this_run - self.last_checkpoint_mark >= interval
    }

    pub fn mark_checkpoint(&mut self) {
        self.last_checkpoint_mark = self.processed_this_run;
    }
}

pub struct ProgressTracker {
    run: RunProgress,
    /// Cumulative counters as loaded at start.
    prior: CheckpointCounters,
    catalog_size: u64,
    queued_at_start: u64,
    report_every: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(prior: CheckpointCounters, catalog_size: usize, queued_at_start: usize, report_every: u64) -> Self {
        Self {
            run: RunProgress::default(),
            prior,
            catalog_size: catalog_size as u64,
            queued_at_start: queued_at_start as u64,
            report_every: report_every.max(1),
            started: Instant::now(),
        }
    }

    pub fn run(&self) -> &RunProgress {
        &self.run
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn checkpoint_due(&self, interval: u64) -> bool {
        self.run.checkpoint_due(interval)
    }

    pub fn mark_checkpoint(&mut self) {
        self.run.mark_checkpoint();
    }

    /// Count a batch of outcomes. Returns true when a progress line is due, which is
    /// judged on attempts so a stretch of failures still reports.
    pub fn record(&mut self, outcomes: &[(WorkKey, Outcome)]) -> bool {
        for (_, outcome) in outcomes {
            if outcome.is_success() {
                self.run.processed_this_run += 1;
            } else {
                self.run.failed_this_run += 1;
            }
        }
        let attempted = self.run.attempted();
        if attempted - self.run.last_report_mark >= self.report_every {
            self.run.last_report_mark = attempted;
            true
        } else {
            false
        }
    }

    pub fn report(&self) -> ProgressLine {
        self.report_at(self.started.elapsed())
    }

    /// Rate and ETA use this run's attempts over this run's elapsed time. Work done
    /// by earlier invocations never inflates the rate.
    pub fn report_at(&self, elapsed: Duration) -> ProgressLine {
        let attempted = self.run.attempted();
        let remaining = self.queued_at_start.saturating_sub(attempted);
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { attempted as f64 / secs } else { 0.0 };
        let eta = (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate));

        ProgressLine {
            succeeded_this_run: self.run.processed_this_run,
            failed_this_run: self.run.failed_this_run,
            remaining,
            total_succeeded: self.prior.succeeded_count + self.run.processed_this_run,
            total_attempted: self.prior.attempted_count + attempted,
            catalog_size: self.catalog_size,
            rate_per_sec: rate,
            elapsed,
            eta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub succeeded_this_run: u64,
    pub failed_this_run: u64,
    pub remaining: u64,
    pub total_succeeded: u64,
    pub total_attempted: u64,
    pub catalog_size: u64,
    pub rate_per_sec: f64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run: {} ok, {} failed, {} remaining | total: {}/{} ok, {} attempted | {}/s | elapsed {} | ETA {}",
            format_human(self.succeeded_this_run as f64),
            format_human(self.failed_this_run as f64),
            format_human(self.remaining as f64),
            format_human(self.total_succeeded as f64),
            format_human(self.catalog_size as f64),
            format_human(self.total_attempted as f64),
            format_human(self.rate_per_sec),
            format_duration(self.elapsed),
            self.eta.map_or_else(|| "unknown".to_string(), format_duration),
        )
    }
}

/// Format a number in human-readable format (K, M, B style)
pub fn format_human(num: f64) -> String {
    if num >= 1_000_000_000.0 {
        format!("{:.1}B", num / 1_000_000_000.0)
    } else if num >= 1_000_000.0 {
        format!("{:.1}M", num / 1_000_000.0)
    } else if num >= 1_000.0 {
        format!("{:.1}K", num / 1_000.0)
    } else if num > 0.0 && num < 10.0 && num.fract() != 0.0 {
        format!("{:.1}", num)
    } else {
        format!("{:.0}", num)
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
