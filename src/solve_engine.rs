use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError, already_exists_error, deadline_exceeded_error};
use log::{error, info};

use crate::header_store::HeaderStore;
use crate::image_utils::ImageStack;
use crate::progress::{ProgressSink, SolveOutcome};
use crate::run_stats::{RunStats, RunStatsAccumulator};
use crate::solve_config::SolveConfig;
use crate::solver_trait::SolverTrait;
use crate::stack_solver;

/// Everything one run needs. Moved onto the worker thread by start().
pub struct SolveJob {
    pub service: Box<dyn SolverTrait + Send>,
    pub image: Box<dyn ImageStack + Send>,
    // Held locked by the worker for the whole run.
    pub headers: Arc<Mutex<dyn HeaderStore + Send>>,
    pub config: SolveConfig,
    pub progress: Arc<dyn ProgressSink>,
}

/// What start() does when a run is already active.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StartPolicy {
    Reject,
    // Cancel the active run and wait up to this long for it to wind down.
    CancelActive(Duration),
}

/// Runs solves of one image on a background thread, at most one at a time.
pub struct SolveEngine {
    // Our state, shared between SolveEngine methods and the worker thread.
    state: Arc<Mutex<EngineState>>,

    // Signalled when the worker thread exits.
    run_finished: Arc<Condvar>,

    // Set to ask the active run to stop. Cleared when a run starts.
    cancel: Arc<AtomicBool>,
}

// State shared between worker thread and the SolveEngine methods.
struct EngineState {
    stats: RunStatsAccumulator,

    // Result of the most recent run, until taken by wait().
    last_outcome: Option<Result<SolveOutcome, CanonicalError>>,

    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for SolveEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SolveEngine {
    /// `stats_window` is the number of recent slices whose medians stats()
    /// reports. Must be at least one.
    pub fn new(stats_window: usize) -> Result<Self, CanonicalError> {
        Ok(SolveEngine{
            state: Arc::new(Mutex::new(EngineState{
                stats: RunStatsAccumulator::new(stats_window)?,
                last_outcome: None,
                worker_thread: None,
            })),
            run_finished: Arc::new(Condvar::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Starts solving `job` on the worker thread and returns immediately.
    /// Fails with InvalidArgument if the job's configuration is bad, with
    /// AlreadyExists if a run is active and `policy` is Reject, and with
    /// DeadlineExceeded if the active run does not stop within the
    /// CancelActive timeout.
    pub fn start(&self, job: SolveJob, policy: StartPolicy) -> Result<(), CanonicalError> {
        job.config.validate()?;
        let mut state = self.state.lock().unwrap();
        if state.worker_thread.is_some() {
            match policy {
                StartPolicy::Reject => {
                    return Err(already_exists_error(
                        "A solve is already running for this image"));
                },
                StartPolicy::CancelActive(timeout) => {
                    info!("Canceling active solve");
                    self.cancel.store(true, Ordering::Relaxed);
                    let (locked_state, _) = self.run_finished.wait_timeout_while(
                        state, timeout, |s| s.worker_thread.is_some()).unwrap();
                    state = locked_state;
                    if state.worker_thread.is_some() {
                        return Err(deadline_exceeded_error(
                            format!("Active solve did not stop within {:?}",
                                    timeout).as_str()));
                    }
                },
            }
        }
        self.cancel.store(false, Ordering::Relaxed);
        state.last_outcome = None;
        state.stats.start_run();
        let cloned_state = self.state.clone();
        let cloned_condvar = self.run_finished.clone();
        let cloned_cancel = self.cancel.clone();
        state.worker_thread = Some(thread::spawn(move || {
            SolveEngine::worker(job, cloned_state, cloned_condvar, cloned_cancel);
        }));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().worker_thread.is_some()
    }

    /// Flag that cancels the active run when set. Safe to set from any
    /// thread, including a signal handler.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Cancels the active run, if any, and waits for the worker thread to
    /// exit.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.worker_thread.is_none() {
            return;
        }
        self.cancel.store(true, Ordering::Relaxed);
        while state.worker_thread.is_some() {
            state = self.run_finished.wait(state).unwrap();
        }
    }

    /// Blocks until no run is active, then returns the result of the last
    /// run. Returns None if there was no run or its result was already
    /// taken.
    pub fn wait(&self) -> Option<Result<SolveOutcome, CanonicalError>> {
        let mut state = self.state.lock().unwrap();
        while state.worker_thread.is_some() {
            state = self.run_finished.wait(state).unwrap();
        }
        state.last_outcome.take()
    }

    pub fn stats(&self) -> RunStats {
        self.state.lock().unwrap().stats.stats()
    }

    pub fn reset_stats(&self) {
        self.state.lock().unwrap().stats.reset();
    }

    fn worker(job: SolveJob,
              state: Arc<Mutex<EngineState>>,
              run_finished: Arc<Condvar>,
              cancel: Arc<AtomicBool>) {
        let SolveJob{service, image, headers, config, progress} = job;
        let result = {
            let mut locked_headers = headers.lock().unwrap();
            stack_solver::run_with_reports(
                service.as_ref(), image.as_ref(), &mut *locked_headers, &config,
                &cancel, progress.as_ref(),
                &mut |_slice, report| state.lock().unwrap().stats.record(report))
        };
        match &result {
            Ok(outcome) => info!("Solve run finished: {:?}", outcome),
            Err(e) => error!("Solve run not started: {}", e.message),
        }
        let mut locked_state = state.lock().unwrap();
        locked_state.last_outcome = Some(result);
        locked_state.worker_thread = None;
        run_finished.notify_all();
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;

    use crate::header_store::MemoryHeaderStore;
    use crate::image_utils::MemoryStack;
    use crate::progress::RecordingProgress;
    use crate::solve_config::{DEFAULT_ALTERNATE_URL, ServerEndpoint};
    use crate::solver_trait::SubmissionStatus;
    use crate::test_support::{FakeSolver, star_field, twelve_stars};
    use crate::wcs_merge::has_valid_wcs;
    use super::*;

    fn test_config() -> SolveConfig {
        SolveConfig{
            endpoint: ServerEndpoint::Alternate(DEFAULT_ALTERNATE_URL.to_string()),
            median_filter_radius: None,
            poll_interval: Duration::from_millis(2),
            submission_timeout: Some(Duration::from_secs(600)),
            job_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        }
    }

    fn job(service: FakeSolver, headers: Arc<Mutex<MemoryHeaderStore>>,
           progress: Arc<RecordingProgress>) -> SolveJob {
        let image = MemoryStack::new(
            vec![star_field(128, 128, &twelve_stars(), 7)]).unwrap();
        SolveJob{service: Box::new(service),
                 image: Box::new(image),
                 headers,
                 config: test_config(),
                 progress}
    }

    // Never gets past submission polling.
    fn stuck_service() -> FakeSolver {
        FakeSolver::new().script_submission(1, vec![Ok(SubmissionStatus::Processing)])
    }

    #[test]
    fn test_runs_in_background() {
        let engine = SolveEngine::new(10).unwrap();
        let headers = Arc::new(Mutex::new(MemoryHeaderStore::new(1)));
        let progress = Arc::new(RecordingProgress::default());
        engine.start(job(FakeSolver::new(), headers.clone(), progress.clone()),
                     StartPolicy::Reject).unwrap();
        assert_eq!(engine.wait().unwrap().unwrap(), SolveOutcome::Success);
        assert!(!engine.is_running());
        assert!(engine.wait().is_none());
        assert!(has_valid_wcs(headers.lock().unwrap().header(0).unwrap()));
        assert_eq!(progress.outcomes(), vec![SolveOutcome::Success]);

        let stats = engine.stats();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.slices_solved, 1);
        assert_eq!(stats.slice_latency.count, 1);
        assert_abs_diff_eq!(stats.submissions.mean, 1.0);
        assert_eq!(stats.submissions.recent_median, Some(1.0));

        engine.reset_stats();
        assert_eq!(engine.stats(), RunStats::default());
    }

    #[test]
    fn test_one_run_at_a_time() {
        let engine = SolveEngine::new(10).unwrap();
        let headers = Arc::new(Mutex::new(MemoryHeaderStore::new(1)));
        let first_progress = Arc::new(RecordingProgress::default());
        engine.start(job(stuck_service(), headers.clone(), first_progress.clone()),
                     StartPolicy::Reject).unwrap();
        assert!(engine.is_running());

        let progress = Arc::new(RecordingProgress::default());
        let err = engine.start(job(FakeSolver::new(), headers.clone(), progress.clone()),
                               StartPolicy::Reject).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::AlreadyExists));

        engine.start(job(FakeSolver::new(), headers.clone(), progress.clone()),
                     StartPolicy::CancelActive(Duration::from_secs(10))).unwrap();
        assert_eq!(engine.wait().unwrap().unwrap(), SolveOutcome::Success);
        assert_eq!(first_progress.outcomes(), vec![SolveOutcome::Canceled]);
        assert_eq!(progress.outcomes(), vec![SolveOutcome::Success]);
        assert_eq!(engine.stats().runs, 2);
    }

    #[test]
    fn test_stop() {
        let engine = SolveEngine::new(10).unwrap();
        let headers = Arc::new(Mutex::new(MemoryHeaderStore::new(1)));
        let progress = Arc::new(RecordingProgress::default());
        engine.start(job(stuck_service(), headers.clone(), progress.clone()),
                     StartPolicy::Reject).unwrap();
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.wait().unwrap().unwrap(), SolveOutcome::Canceled);
        assert!(headers.lock().unwrap().header(0).is_none());
        // Nothing to stop.
        engine.stop();
    }

    #[test]
    fn test_zero_stats_window() {
        let err = SolveEngine::new(0).err().unwrap();
        assert!(matches!(err.code, CanonicalErrorCode::InvalidArgument));
    }

    #[test]
    fn test_bad_config_not_started() {
        let engine = SolveEngine::new(10).unwrap();
        let headers = Arc::new(Mutex::new(MemoryHeaderStore::new(1)));
        let progress = Arc::new(RecordingProgress::default());
        let mut bad = job(FakeSolver::new(), headers, progress);
        bad.config.max_sources = 0;
        let err = engine.start(bad, StartPolicy::Reject).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::InvalidArgument));
        assert!(!engine.is_running());
        assert_eq!(engine.stats().runs, 0);
    }

}  // mod tests.
