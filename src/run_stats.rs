use std::collections::VecDeque;

use canonical_error::{CanonicalError, invalid_argument_error};
use medians::Medianf64;

use crate::progress::SolveOutcome;
use crate::slice_solver::SliceReport;

/// Summary of one per-slice figure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FigureStats {
    // Slices contributing to the figure since the last reset.
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,

    // Over the most recent slices only; None until there is one.
    pub recent_median: Option<f64>,
    pub recent_median_absolute_deviation: Option<f64>,
}

/// What the engine has seen since it was created or last reset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunStats {
    pub runs: u32,
    pub slices_solved: u32,
    pub slices_skipped: u32,
    pub slices_failed: u32,

    // Seconds taken by each successfully solved slice.
    pub slice_latency: FigureStats,

    // Uploads per slice, counting retries. Slices that never got as far as
    // an upload are not included.
    pub submissions: FigureStats,
}

// The figures one slice report contributes.
struct SliceSample {
    latency: Option<f64>,
    submissions: Option<f64>,
}

pub struct RunStatsAccumulator {
    stats: RunStats,

    // Most recent samples, newest last, at most `window` of them.
    window: usize,
    recent: VecDeque<SliceSample>,

    latency_totals: rolling_stats::Stats<f64>,
    submission_totals: rolling_stats::Stats<f64>,
}

impl RunStatsAccumulator {
    /// `window` is how many recent slices the medians are taken over.
    pub fn new(window: usize) -> Result<Self, CanonicalError> {
        if window == 0 {
            return Err(invalid_argument_error("Stats window must be at least one slice"));
        }
        Ok(RunStatsAccumulator{
            stats: RunStats::default(),
            window,
            recent: VecDeque::with_capacity(window),
            latency_totals: rolling_stats::Stats::<f64>::new(),
            submission_totals: rolling_stats::Stats::<f64>::new(),
        })
    }

    pub fn start_run(&mut self) {
        self.stats.runs += 1;
    }

    pub fn record(&mut self, report: &SliceReport) {
        let latency = match report.outcome {
            SolveOutcome::Success => {
                self.stats.slices_solved += 1;
                Some(report.elapsed.as_secs_f64())
            },
            SolveOutcome::Skipped => {
                self.stats.slices_skipped += 1;
                None
            },
            SolveOutcome::Failed => {
                self.stats.slices_failed += 1;
                None
            },
            SolveOutcome::Canceled => None,
        };
        let submissions = (report.submissions > 0).then_some(report.submissions as f64);
        if latency.is_none() && submissions.is_none() {
            return;
        }
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(SliceSample{latency, submissions});

        if let Some(seconds) = latency {
            self.latency_totals.update(seconds);
            self.stats.slice_latency.count += 1;
            update_figure(&mut self.stats.slice_latency, &self.latency_totals,
                          self.recent.iter().filter_map(|s| s.latency));
        }
        if let Some(uploads) = submissions {
            self.submission_totals.update(uploads);
            self.stats.submissions.count += 1;
            update_figure(&mut self.stats.submissions, &self.submission_totals,
                          self.recent.iter().filter_map(|s| s.submissions));
        }
    }

    pub fn stats(&self) -> RunStats {
        self.stats.clone()
    }

    /// Clears everything, including the run count.
    pub fn reset(&mut self) {
        self.stats = RunStats::default();
        self.recent.clear();
        self.latency_totals = rolling_stats::Stats::<f64>::new();
        self.submission_totals = rolling_stats::Stats::<f64>::new();
    }
}

fn update_figure(figure: &mut FigureStats, totals: &rolling_stats::Stats<f64>,
                 recent: impl Iterator<Item = f64>) {
    figure.min = totals.min;
    figure.max = totals.max;
    figure.mean = totals.mean;
    figure.stddev = totals.std_dev;
    let recent: Vec<f64> = recent.collect();
    if recent.is_empty() {
        return;
    }
    let median = recent.as_slice().medf_unchecked();
    figure.recent_median = Some(median);
    figure.recent_median_absolute_deviation = Some(recent.as_slice().madf(median));
}

// mod tests.
