use std::sync::Mutex;

use log::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveOutcome {
    Success,
    Failed,
    // The slice already had a valid solution.
    Skipped,
    Canceled,
}

// Receives human readable status while a solve runs. Called from the worker
// thread.
pub trait ProgressSink: Send + Sync {
    fn status(&self, message: &str);

    fn finished(&self, _outcome: SolveOutcome) {}
}

/// Forwards status to the logger.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn status(&self, message: &str) {
        info!("{}", message);
    }
    fn finished(&self, outcome: SolveOutcome) {
        info!("Solve finished: {:?}", outcome);
    }
}

// Prepends "slice k/n" to everything passed through.
pub struct SliceProgress<'a> {
    inner: &'a dyn ProgressSink,
    prefix: String,
}

impl<'a> SliceProgress<'a> {
    pub fn new(inner: &'a dyn ProgressSink, label: &str,
               ordinal: usize, count: usize) -> Self {
        SliceProgress{inner, prefix: format!("{} ({}/{})", label, ordinal, count)}
    }
}

impl ProgressSink for SliceProgress<'_> {
    fn status(&self, message: &str) {
        self.inner.status(format!("{}: {}", self.prefix, message).as_str());
    }
    fn finished(&self, outcome: SolveOutcome) {
        self.inner.finished(outcome);
    }
}

/// Keeps every message and outcome; for front ends that poll, and for tests.
#[derive(Default)]
pub struct RecordingProgress {
    messages: Mutex<Vec<String>>,
    outcomes: Mutex<Vec<SolveOutcome>>,
}

impl RecordingProgress {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
    pub fn outcomes(&self) -> Vec<SolveOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn status(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
    fn finished(&self, outcome: SolveOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

// mod tests.
