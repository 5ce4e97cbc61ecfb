use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::CanonicalError;

// Longest uninterrupted sleep; bounds how long a stop request can go unseen.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
pub struct PollSchedule {
    pub interval: Duration,
    // Wall clock budget for the whole poll.
    pub timeout: Duration,
}

impl PollSchedule {
    // Number of calls that fit in `timeout`, at least one.
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return u32::MAX;
        }
        let n = self.timeout.as_secs_f64() / self.interval.as_secs_f64();
        (n.ceil() as u32).max(1)
    }
}

/// What one poll call observed.
pub enum PollStep<T> {
    Ready(T),
    // Not done yet; try again after the interval.
    Pending,
    // Give up now.
    Fail(CanonicalError),
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut{attempts: u32},
    Canceled,
    Failed(CanonicalError),
}

/// Calls `call` (with the 1-based attempt number) until it reports Ready or
/// Fail, the schedule's attempts or wall clock budget run out, or `cancel`
/// is set. `cancel` is checked before every call and while sleeping, so no
/// call is made after a stop request is seen.
pub fn poll_until<T, F>(schedule: &PollSchedule, cancel: &AtomicBool, mut call: F)
                        -> PollOutcome<T>
where F: FnMut(u32) -> PollStep<T> {
    let start = Instant::now();
    let max_attempts = schedule.max_attempts();
    let mut attempts = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return PollOutcome::Canceled;
        }
        if attempts >= max_attempts || start.elapsed() >= schedule.timeout {
            return PollOutcome::TimedOut{attempts};
        }
        attempts += 1;
        match call(attempts) {
            PollStep::Ready(value) => return PollOutcome::Ready(value),
            PollStep::Fail(e) => return PollOutcome::Failed(e),
            PollStep::Pending => (),
        }
        if !sleep_unless_canceled(schedule.interval, cancel) {
            return PollOutcome::Canceled;
        }
    }
}

/// Sleeps for `duration` in short steps. Returns false, early, if `cancel`
/// gets set.
pub fn sleep_unless_canceled(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
    }
}

// mod tests.
