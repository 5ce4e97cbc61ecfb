// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, CanonicalErrorCode, failed_precondition_error};
use chrono::Local;
use log::{debug, error, info, warn};

use crate::centroid::measure_centroid;
use crate::fits_header::Header;
use crate::header_store::HeaderStore;
use crate::image_utils::{FloatImage, ImageStack, median_filter};
use crate::peak_finder::{PeakParams, find_peaks};
use crate::poll::{PollOutcome, PollSchedule, PollStep, poll_until};
use crate::progress::{ProgressSink, SolveOutcome};
use crate::solve_config::SolveConfig;
use crate::solver_trait::{Annotation, FailureKind, ImagePos, JobId, JobStatus,
                          Session, SolverTrait, SubmissionId, SubmissionStatus,
                          failure_kind};
use crate::source_list::{UploadPayload, build_payload};
use crate::wcs_merge::{add_solve_history, annotation_card, has_valid_wcs,
                       merge_wcs, remove_solver_annotations};

/// Stages a slice moves through, in order. A failed attempt goes back to
/// Filter for a fresh submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStage {
    Start,
    Filter,
    Detect,
    Encode,
    Upload,
    SubmissionPoll,
    JobPoll,
    FetchWcs,
    FetchAnnotations,
    WriteResult,
    Done,
}

#[derive(Clone, Debug)]
pub struct SliceReport {
    pub outcome: SolveOutcome,

    // Uploads made for the slice, including retries.
    pub submissions: u32,

    // Sources in the most recent upload.
    pub num_sources: usize,

    // Where the slice stopped. Done on success.
    pub final_stage: SolveStage,

    pub elapsed: Duration,
}

// A stage together with what it consumes.
enum Step {
    Start,
    Filter,
    Detect(FloatImage),
    Encode(Vec<ImagePos>),
    Upload(UploadPayload),
    SubmissionPoll(SubmissionId),
    JobPoll(JobId),
    FetchWcs(JobId),
    FetchAnnotations(JobId, Header),
    WriteResult(Header, Vec<Annotation>),
    Done,
}

impl Step {
    fn stage(&self) -> SolveStage {
        match self {
            Step::Start => SolveStage::Start,
            Step::Filter => SolveStage::Filter,
            Step::Detect(_) => SolveStage::Detect,
            Step::Encode(_) => SolveStage::Encode,
            Step::Upload(_) => SolveStage::Upload,
            Step::SubmissionPoll(_) => SolveStage::SubmissionPoll,
            Step::JobPoll(_) => SolveStage::JobPoll,
            Step::FetchWcs(_) => SolveStage::FetchWcs,
            Step::FetchAnnotations(_, _) => SolveStage::FetchAnnotations,
            Step::WriteResult(_, _) => SolveStage::WriteResult,
            Step::Done => SolveStage::Done,
        }
    }
}

// Why a stage did not hand over to the next one.
enum Interrupt {
    Canceled,
    // Header already has a solution.
    Skip,
    // Resubmit if retries remain.
    Retry(String),
    // The slice fails; no retry.
    Fatal(String),
}

// Per-slice state carried across stages and retries.
struct SliceRun {
    pixels: Option<FloatImage>,
    header: Option<Header>,
    tolerance: f64,
    retries: u32,
    submissions: u32,
    num_sources: usize,
}

/// Drives one slice from raw pixels to a solved header, using a session
/// already established with the solve service.
pub struct SliceSolver<'a> {
    service: &'a dyn SolverTrait,
    session: &'a Session,
    config: &'a SolveConfig,
    cancel: &'a AtomicBool,
    progress: &'a dyn ProgressSink,
}

impl<'a> SliceSolver<'a> {
    pub fn new(service: &'a dyn SolverTrait,
               session: &'a Session,
               config: &'a SolveConfig,
               cancel: &'a AtomicBool,
               progress: &'a dyn ProgressSink) -> Self {
        SliceSolver{service, session, config, cancel, progress}
    }

    fn canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Solves `slice` of `image`, writing the result into `headers`. Never
    /// returns an error: everything that can go wrong ends up in the
    /// report's outcome, and is logged.
    pub fn solve(&self, image: &dyn ImageStack, slice: usize,
                 headers: &mut dyn HeaderStore) -> SliceReport {
        let start_time = Instant::now();
        let label = image.slice_label(slice);
        let mut run = SliceRun{pixels: None, header: None, tolerance: 0.0,
                               retries: 0, submissions: 0, num_sources: 0};
        let mut step = Step::Start;
        let mut stage = SolveStage::Start;
        let outcome = loop {
            if self.canceled() {
                break SolveOutcome::Canceled;
            }
            stage = step.stage();
            if stage == SolveStage::Done {
                break SolveOutcome::Success;
            }
            debug!("{}: {:?}", label, stage);
            step = match self.advance(step, &mut run, image, slice, headers) {
                Ok(next) => next,
                Err(_) if self.canceled() => break SolveOutcome::Canceled,
                Err(Interrupt::Canceled) => break SolveOutcome::Canceled,
                Err(Interrupt::Skip) => {
                    info!("{} already has a WCS solution; skipping", label);
                    self.progress.status("Already solved, skipping");
                    break SolveOutcome::Skipped;
                },
                Err(Interrupt::Fatal(msg)) => {
                    error!("{}: {}", label, msg);
                    self.progress.status(format!("Failed: {}", msg).as_str());
                    break SolveOutcome::Failed;
                },
                Err(Interrupt::Retry(msg)) => {
                    if run.retries >= self.config.max_retries {
                        error!("{}: {}; giving up after {} submissions",
                               label, msg, run.submissions);
                        self.progress.status(format!("Failed: {}", msg).as_str());
                        break SolveOutcome::Failed;
                    }
                    run.retries += 1;
                    warn!("{}: {}; resubmitting (retry {} of {})",
                          label, msg, run.retries, self.config.max_retries);
                    self.progress.status(format!("{}; retrying", msg).as_str());
                    Step::Filter
                },
            };
        };  // loop.
        if outcome == SolveOutcome::Success {
            info!("{} solved in {:.1}s", label, start_time.elapsed().as_secs_f64());
        }
        SliceReport{outcome,
                    submissions: run.submissions,
                    num_sources: run.num_sources,
                    final_stage: stage,
                    elapsed: start_time.elapsed()}
    }

    fn advance(&self, step: Step, run: &mut SliceRun, image: &dyn ImageStack,
               slice: usize, headers: &mut dyn HeaderStore)
               -> Result<Step, Interrupt> {
        match step {
            Step::Start => self.start(run, image, slice, &*headers),
            Step::Filter => self.filter(run),
            Step::Detect(filtered) => self.detect(run, filtered),
            Step::Encode(sources) => Ok(Step::Upload(build_payload(
                &sources, self.config, self.session, image.width(), image.height()))),
            Step::Upload(payload) => self.upload(run, &payload),
            Step::SubmissionPoll(submission) => self.poll_submission(submission),
            Step::JobPoll(job) => self.poll_job(job),
            Step::FetchWcs(job) => self.fetch_wcs(job),
            Step::FetchAnnotations(job, solution) => self.fetch_annotations(job, solution),
            Step::WriteResult(solution, annotations) =>
                self.write_result(run, image, slice, headers, &solution, &annotations),
            Step::Done => Ok(Step::Done),
        }
    }

    fn start(&self, run: &mut SliceRun, image: &dyn ImageStack, slice: usize,
             headers: &dyn HeaderStore) -> Result<Step, Interrupt> {
        let header = headers.get_header(slice).map_err(
            |e| Interrupt::Fatal(format!("Could not read header: {}", e.message)))?;
        if self.config.skip_if_solved && header.as_ref().is_some_and(has_valid_wcs) {
            return Err(Interrupt::Skip);
        }
        let pixels = image.slice(slice).map_err(
            |e| Interrupt::Fatal(format!("Could not read pixels: {}", e.message)))?;
        // The noise estimate comes from the unfiltered pixels.
        run.tolerance = self.config.noise_tolerance_sigma * pixels.stats().std_dev;
        run.pixels = Some(pixels);
        run.header = header;
        Ok(Step::Filter)
    }

    fn filter(&self, run: &SliceRun) -> Result<Step, Interrupt> {
        let Some(pixels) = &run.pixels else {
            return Err(Interrupt::Fatal("No pixels loaded".to_string()));
        };
        let Some(radius) = self.config.median_filter_radius else {
            return Ok(Step::Detect(pixels.clone()));
        };
        self.progress.status(format!("Median filter, radius {}", radius).as_str());
        match median_filter(pixels, radius, self.cancel) {
            Some(filtered) => Ok(Step::Detect(filtered)),
            None => Err(Interrupt::Canceled),
        }
    }

    fn detect(&self, run: &mut SliceRun, filtered: FloatImage) -> Result<Step, Interrupt> {
        self.progress.status(
            format!("Finding maxima, tolerance {:.2}", run.tolerance).as_str());
        let params = PeakParams{tolerance: run.tolerance,
                                exclude_edges: self.config.exclude_edges,
                                max_peak_value: self.config.max_peak_value};
        let mut candidates = find_peaks(&filtered, self.config.roi, &params,
                                        self.cancel, self.progress);
        if self.canceled() {
            return Err(Interrupt::Canceled);
        }
        if candidates.is_empty() {
            return Err(Interrupt::Fatal("No sources found".to_string()));
        }
        candidates.truncate(self.config.max_sources);
        let sources: Vec<ImagePos> = match &self.config.centroid {
            None => candidates.iter().map(|c| c.pos).collect(),
            Some(aperture) => {
                self.progress.status("Finding centroids");
                candidates.iter().map(|c| {
                    measure_centroid(&filtered, c.pos, aperture).unwrap_or(c.pos)
                }).collect()
            },
        };
        run.num_sources = sources.len();
        Ok(Step::Encode(sources))
    }

    fn upload(&self, run: &mut SliceRun, payload: &UploadPayload)
              -> Result<Step, Interrupt> {
        self.progress.status(format!("Uploading {} sources", payload.num_sources).as_str());
        run.submissions += 1;
        match self.service.submit(self.session, payload) {
            Ok(submission) => Ok(Step::SubmissionPoll(submission)),
            Err(e) => Err(classify(&e, "Upload")),
        }
    }

    fn poll_submission(&self, submission: SubmissionId) -> Result<Step, Interrupt> {
        let schedule = PollSchedule{interval: self.config.poll_interval,
                                    timeout: self.config.submission_timeout()};
        let outcome = poll_until(&schedule, self.cancel, |attempt| {
            match self.service.poll_submission(submission) {
                Ok(SubmissionStatus::JobAssigned(job)) => PollStep::Ready(job),
                Ok(SubmissionStatus::Processing) => {
                    self.progress.status(
                        format!("Waiting for submission {} to start ({})",
                                submission, attempt).as_str());
                    PollStep::Pending
                },
                // A new submission may not be visible yet.
                Err(e) if failure_kind(&e) == FailureKind::Transport ||
                    matches!(e.code, CanonicalErrorCode::NotFound) => {
                    debug!("Submission {} poll {}: {}", submission, attempt, e.message);
                    PollStep::Pending
                },
                Err(e) => PollStep::Fail(e),
            }
        });
        match outcome {
            PollOutcome::Ready(job) => {
                info!("Submission {} started job {}", submission, job);
                Ok(Step::JobPoll(job))
            },
            PollOutcome::TimedOut{attempts} => Err(Interrupt::Retry(
                format!("Submission {} did not start after {} polls", submission, attempts))),
            PollOutcome::Canceled => Err(Interrupt::Canceled),
            PollOutcome::Failed(e) => Err(classify(&e, "Submission status")),
        }
    }

    fn poll_job(&self, job: JobId) -> Result<Step, Interrupt> {
        let schedule = PollSchedule{interval: self.config.poll_interval,
                                    timeout: self.config.job_timeout()};
        let outcome = poll_until(&schedule, self.cancel, |attempt| {
            match self.service.poll_job(job) {
                Ok(JobStatus::Success) => PollStep::Ready(()),
                Ok(JobStatus::Processing(status)) => {
                    self.progress.status(
                        format!("Job {} {} ({})", job, status, attempt).as_str());
                    PollStep::Pending
                },
                Ok(status) => PollStep::Fail(failed_precondition_error(
                    format!("Job {} ended with status {:?}", job, status).as_str())),
                Err(e) => PollStep::Fail(e),
            }
        });
        match outcome {
            PollOutcome::Ready(()) => Ok(Step::FetchWcs(job)),
            PollOutcome::TimedOut{attempts} => Err(Interrupt::Retry(
                format!("Job {} not finished after {} polls", job, attempts))),
            PollOutcome::Canceled => Err(Interrupt::Canceled),
            PollOutcome::Failed(e) => Err(classify(&e, "Job status")),
        }
    }

    fn fetch_wcs(&self, job: JobId) -> Result<Step, Interrupt> {
        self.progress.status(format!("Downloading solution for job {}", job).as_str());
        let solution = self.service.fetch_wcs(job).map_err(|e| classify(&e, "WCS download"))?;
        if !has_valid_wcs(&solution) {
            return Err(Interrupt::Fatal(
                format!("Job {} returned an incomplete WCS solution", job)));
        }
        if self.config.annotate {
            Ok(Step::FetchAnnotations(job, solution))
        } else {
            Ok(Step::WriteResult(solution, Vec::new()))
        }
    }

    fn fetch_annotations(&self, job: JobId, solution: Header) -> Result<Step, Interrupt> {
        let annotations = match self.service.fetch_annotations(job) {
            Ok(annotations) => annotations,
            Err(e) => {
                warn!("Ignoring annotations for job {}: {}", job, e.message);
                Vec::new()
            },
        };
        Ok(Step::WriteResult(solution, annotations))
    }

    fn write_result(&self, run: &SliceRun, image: &dyn ImageStack, slice: usize,
                    headers: &mut dyn HeaderStore, solution: &Header,
                    annotations: &[Annotation]) -> Result<Step, Interrupt> {
        let mut header = match &run.header {
            Some(h) => h.clone(),
            None => Header::minimal(image.width(), image.height()),
        };
        add_solve_history(&mut header, self.config.endpoint.base_url(), Local::now());
        let added = merge_wcs(&mut header, solution);
        if self.config.annotate {
            remove_solver_annotations(&mut header);
            for annotation in annotations {
                header.push(annotation_card(annotation, &self.config.annotation_style));
            }
        }
        headers.put_header(slice, header).map_err(
            |e| Interrupt::Fatal(format!("Could not update header: {}", e.message)))?;
        if self.config.persist {
            headers.persist(slice).map_err(
                |e| Interrupt::Fatal(format!("Could not save header: {}", e.message)))?;
        }
        self.progress.status(format!("Solved: {} WCS cards, {} annotations",
                                     added, annotations.len()).as_str());
        Ok(Step::Done)
    }
}

// Retry on anything the service might get right next time.
fn classify(error: &CanonicalError, what: &str) -> Interrupt {
    let message = format!("{} failed: {}", what, error.message);
    match failure_kind(error) {
        FailureKind::Transport | FailureKind::Rejected => Interrupt::Retry(message),
        FailureKind::Malformed | FailureKind::Config => Interrupt::Fatal(message),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use canonical_error::failed_precondition_error;

    use crate::fits_header::HeaderCard;
    use crate::header_store::MemoryHeaderStore;
    use crate::image_utils::MemoryStack;
    use crate::progress::RecordingProgress;
    use crate::solve_config::{DEFAULT_ALTERNATE_URL, ServerEndpoint};
    use crate::test_support::{FakeSolver, Fault, solution_header, star_field,
                              twelve_stars};
    use crate::wcs_merge::is_wcs_keyword;
    use super::*;

    fn test_config() -> SolveConfig {
        SolveConfig{
            endpoint: ServerEndpoint::Alternate(DEFAULT_ALTERNATE_URL.to_string()),
            poll_interval: Duration::from_millis(1),
            submission_timeout: Some(Duration::from_millis(50)),
            job_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        }
    }

    fn stack() -> MemoryStack {
        MemoryStack::new(vec![star_field(128, 128, &twelve_stars(), 42)]).unwrap()
    }

    fn solve(fake: &FakeSolver, headers: &mut dyn HeaderStore, config: &SolveConfig,
             cancel: &AtomicBool) -> SliceReport {
        let session = Session("session-1".to_string());
        let progress = RecordingProgress::default();
        SliceSolver::new(fake, &session, config, cancel, &progress)
            .solve(&stack(), 0, headers)
    }

    fn count_keys(header: &Header, pred: impl Fn(&str) -> bool) -> usize {
        header.cards().iter().filter(|c| pred(&c.key)).count()
    }

    #[test]
    fn test_solves_slice_end_to_end() {
        let fake = FakeSolver::new()
            .wcs(Ok(solution_header(20)))
            .annotations(Ok(vec![
                Annotation{name: "Betelgeuse".to_string(), pixel_x: 20.5, pixel_y: 24.5},
                Annotation{name: "α Ori".to_string(), pixel_x: 48.5, pixel_y: 24.5},
                Annotation{name: "M 42".to_string(), pixel_x: 76.5, pixel_y: 60.5},
            ]));
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);

        assert_eq!(report.outcome, SolveOutcome::Success);
        assert_eq!(report.final_stage, SolveStage::Done);
        assert_eq!(report.submissions, 1);
        assert_eq!(report.num_sources, 12);
        assert_eq!(fake.calls(), vec!["submit", "poll_submission 1", "poll_job 1",
                                      "fetch_wcs 1", "fetch_annotations 1"]);

        let payload = &fake.payloads()[0];
        assert_eq!(payload.num_sources, 12);
        // Brightest first, y flipped.
        assert!(payload.source_table.starts_with("20.5 \t 103.5\r\n"));
        assert!(payload.request_json.contains("\"session\":\"session-1\""));

        let header = headers.header(0).unwrap();
        assert!(has_valid_wcs(header));
        assert_eq!(header.get_f64("NAXIS1"), Some(128.0));
        assert_eq!(count_keys(header, is_wcs_keyword), 20);
        assert_eq!(count_keys(header, |k| k == "ANNOTATE"), 3);
        assert_eq!(count_keys(header, |k| k == "COMMENT"), 0);
        let history: Vec<String> = header.cards().iter()
            .filter(|c| c.key == "HISTORY")
            .filter_map(|c| c.comment.clone())
            .collect();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], "WCS solution obtained from http://127.0.0.1:8080");
        assert!(history[1].starts_with("WCS solution written "));
        assert!(headers.persisted().is_empty());
    }

    #[test]
    fn test_skips_solved_slice() {
        let fake = FakeSolver::new();
        let mut solved = Header::minimal(128, 128);
        merge_wcs(&mut solved, &solution_header(11));
        let mut headers = MemoryHeaderStore::with_headers(vec![Some(solved)]);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Skipped);
        assert!(fake.calls().is_empty());

        let config = SolveConfig{skip_if_solved: false, ..test_config()};
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);
        assert_eq!(fake.count("submit"), 1);
    }

    #[test]
    fn test_resolve_replaces_previous_solution() {
        let fake = FakeSolver::new()
            .wcs(Ok(solution_header(11)))
            .annotations(Ok(vec![
                Annotation{name: "Rigel".to_string(), pixel_x: 1.0, pixel_y: 2.0}]));
        let mut old = Header::minimal(128, 128);
        old.push(HeaderCard::string("OBJECT", "M42", None));
        old.push(HeaderCard::new("CDELT1", "0.01", None));
        old.push(HeaderCard::new("B_3_3", "1.0E-9", None));
        old.push(HeaderCard::string("ANNOTATE", "5,5,30,1,0,1,1,orange", Some("stale")));
        old.push(HeaderCard::string("ANNOTATE", "9,9,10,1,0,1,0,red", Some("mine")));
        let mut headers = MemoryHeaderStore::with_headers(vec![Some(old)]);
        let config = SolveConfig{persist: true, ..test_config()};
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);

        let header = headers.header(0).unwrap();
        assert_eq!(header.get_string("OBJECT"), Some("M42".to_string()));
        assert!(!header.contains("B_3_3"));
        assert_eq!(header.get_f64("CDELT1"), Some(0.01));
        let annotations: Vec<Option<String>> = header.cards().iter()
            .filter(|c| c.key == "ANNOTATE")
            .map(|c| c.comment.clone())
            .collect();
        assert_eq!(annotations, vec![Some("mine".to_string()), Some("Rigel".to_string())]);
        assert_eq!(headers.persisted(), &[0]);
    }

    #[test]
    fn test_retries_exhausted_on_timeouts() {
        let fake = FakeSolver::new()
            .script_submission(1, vec![Ok(SubmissionStatus::Processing)])
            .script_submission(2, vec![Ok(SubmissionStatus::Processing)]);
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.final_stage, SolveStage::SubmissionPoll);
        assert_eq!(report.submissions, 2);
        assert_eq!(fake.count("submit"), 2);
        assert_eq!(fake.count("poll_job"), 0);
        assert!(headers.header(0).is_none());
    }

    #[test]
    fn test_no_retries() {
        let fake = FakeSolver::new().fail_submits(&[Fault::Transport]);
        let mut headers = MemoryHeaderStore::new(1);
        let config = SolveConfig{max_retries: 0, ..test_config()};
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.final_stage, SolveStage::Upload);
        assert_eq!(report.submissions, 1);
    }

    #[test]
    fn test_upload_transport_error_is_retried() {
        let fake = FakeSolver::new().fail_submits(&[Fault::Transport]);
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);
        assert_eq!(report.submissions, 2);
        assert_eq!(fake.payloads().len(), 1);
    }

    #[test]
    fn test_failed_job_is_retried() {
        let fake = FakeSolver::new()
            .script_job(1, vec![Ok(JobStatus::Processing("solving".to_string())),
                                Ok(JobStatus::Failure)]);
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);
        assert_eq!(report.submissions, 2);
        assert_eq!(fake.count("poll_job 1"), 2);
        assert_eq!(fake.count("poll_job 2"), 1);
    }

    #[test]
    fn test_retries_exhausted_on_job_timeouts() {
        let fake = FakeSolver::new()
            .script_job(1, vec![Ok(JobStatus::Processing("solving".to_string()))])
            .script_job(2, vec![Ok(JobStatus::Processing("solving".to_string()))]);
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.final_stage, SolveStage::JobPoll);
        assert_eq!(report.submissions, 2);
        assert_eq!(fake.count("submit"), 2);
        assert!(fake.count("poll_job 1") > 1);
        assert!(fake.count("poll_job 2") > 1);
        assert_eq!(fake.count("fetch_wcs"), 0);
        assert!(headers.header(0).is_none());
    }

    #[test]
    fn test_job_error_and_transport_are_retried() {
        let fake = FakeSolver::new()
            .script_job(1, vec![Ok(JobStatus::Error)])
            .script_job(2, vec![Err(Fault::Transport)]);
        let mut headers = MemoryHeaderStore::new(1);
        let config = SolveConfig{max_retries: 2, ..test_config()};
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);
        assert_eq!(report.submissions, 3);
        assert_eq!(fake.count("poll_job 1"), 1);
        assert_eq!(fake.count("poll_job 2"), 1);
        assert_eq!(fake.count("fetch_wcs 3"), 1);

        // Same failures with a single retry.
        let fake = FakeSolver::new()
            .script_job(1, vec![Ok(JobStatus::Error)])
            .script_job(2, vec![Err(Fault::Transport)]);
        let mut headers = MemoryHeaderStore::new(1);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.final_stage, SolveStage::JobPoll);
        assert_eq!(report.submissions, 2);
    }

    #[test]
    fn test_cancel_during_job_poll() {
        let cancel = Arc::new(AtomicBool::new(false));
        let fake = FakeSolver::new()
            .script_job(1, vec![Ok(JobStatus::Processing("solving".to_string()))])
            .cancel_on("poll_job", cancel.clone());
        let mut headers = MemoryHeaderStore::new(1);
        let config = SolveConfig{poll_interval: Duration::from_secs(5),
                                 job_timeout: Some(Duration::from_secs(600)),
                                 ..test_config()};
        let start = Instant::now();
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Canceled);
        assert_eq!(report.final_stage, SolveStage::JobPoll);
        assert_eq!(fake.calls(), vec!["submit", "poll_submission 1", "poll_job 1"]);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(headers.header(0).is_none());
    }

    #[test]
    fn test_submission_not_visible_yet() {
        let fake = FakeSolver::new()
            .script_submission(1, vec![Err(Fault::NotFound), Err(Fault::Transport),
                                       Ok(SubmissionStatus::Processing),
                                       Ok(SubmissionStatus::JobAssigned(JobId(9)))]);
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);
        assert_eq!(report.submissions, 1);
        assert_eq!(fake.count("poll_submission 1"), 4);
        assert_eq!(fake.count("fetch_wcs 9"), 1);
    }

    #[test]
    fn test_malformed_wcs_fails_without_retry() {
        let fake = FakeSolver::new().wcs(Err(Fault::Malformed));
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.final_stage, SolveStage::FetchWcs);
        assert_eq!(report.submissions, 1);

        // Decodes, but is not a usable solution.
        let fake = FakeSolver::new().wcs(Ok(Header::minimal(4, 4)));
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.submissions, 1);
    }

    #[test]
    fn test_annotation_failure_is_ignored() {
        let fake = FakeSolver::new().annotations(Err(Fault::Transport));
        let mut headers = MemoryHeaderStore::new(1);
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);
        let header = headers.header(0).unwrap();
        assert!(has_valid_wcs(header));
        assert!(!header.contains("ANNOTATE"));

        let fake = FakeSolver::new();
        let config = SolveConfig{annotate: false, ..test_config()};
        solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(fake.count("fetch_annotations"), 0);
    }

    #[test]
    fn test_cancel_during_submission_poll() {
        let cancel = Arc::new(AtomicBool::new(false));
        let fake = FakeSolver::new()
            .script_submission(1, vec![Ok(SubmissionStatus::Processing)])
            .cancel_on("poll_submission", cancel.clone());
        let mut headers = MemoryHeaderStore::new(1);
        let config = SolveConfig{poll_interval: Duration::from_secs(5),
                                 submission_timeout: Some(Duration::from_secs(600)),
                                 ..test_config()};
        let start = Instant::now();
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Canceled);
        assert_eq!(fake.calls(), vec!["submit", "poll_submission 1"]);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(headers.header(0).is_none());
    }

    #[test]
    fn test_cancel_wins_over_error() {
        let cancel = Arc::new(AtomicBool::new(false));
        let fake = FakeSolver::new()
            .fail_submits(&[Fault::Rejected])
            .cancel_on("submit", cancel.clone());
        let mut headers = MemoryHeaderStore::new(1);
        let report = solve(&fake, &mut headers, &test_config(), &cancel);
        assert_eq!(report.outcome, SolveOutcome::Canceled);
        assert_eq!(fake.count("submit"), 1);
    }

    #[test]
    fn test_no_sources() {
        let fake = FakeSolver::new();
        let image = MemoryStack::new(vec![FloatImage::filled(64, 64, 100.0)]).unwrap();
        let mut headers = MemoryHeaderStore::new(1);
        let session = Session("s".to_string());
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let progress = RecordingProgress::default();
        let report = SliceSolver::new(&fake, &session, &config, &cancel, &progress)
            .solve(&image, 0, &mut headers);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.final_stage, SolveStage::Detect);
        assert_eq!(report.submissions, 0);
        assert!(fake.calls().is_empty());
        assert_eq!(progress.messages().last().unwrap(), "Failed: No sources found");
    }

    // Header store whose persist() always fails.
    struct ReadOnlyStore(MemoryHeaderStore);

    impl HeaderStore for ReadOnlyStore {
        fn get_header(&self, slice: usize) -> Result<Option<Header>, CanonicalError> {
            self.0.get_header(slice)
        }
        fn put_header(&mut self, slice: usize, header: Header) -> Result<(), CanonicalError> {
            self.0.put_header(slice, header)
        }
        fn persist(&mut self, _slice: usize) -> Result<(), CanonicalError> {
            Err(failed_precondition_error("read only"))
        }
    }

    #[test]
    fn test_persist_failure_fails_slice() {
        let fake = FakeSolver::new();
        let mut headers = ReadOnlyStore(MemoryHeaderStore::new(1));
        let config = SolveConfig{persist: true, ..test_config()};
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Failed);
        assert_eq!(report.final_stage, SolveStage::WriteResult);
        assert_eq!(fake.count("submit"), 1);
    }

    #[test]
    fn test_centroid_refinement() {
        let fake = FakeSolver::new();
        let mut headers = MemoryHeaderStore::new(1);
        let config = SolveConfig{
            centroid: Some(crate::centroid::Aperture{radius: 5.0, back_inner: 7.0,
                                                     back_outer: 10.0,
                                                     ..Default::default()}),
            median_filter_radius: None,
            max_sources: 4,
            ..test_config()};
        let cancel = AtomicBool::new(false);
        let report = solve(&fake, &mut headers, &config, &cancel);
        assert_eq!(report.outcome, SolveOutcome::Success);
        assert_eq!(report.num_sources, 4);
        let table = &fake.payloads()[0].source_table;
        let first: Vec<f64> = table.lines().next().unwrap()
            .split('\t').map(|s| s.trim().parse().unwrap()).collect();
        assert!((first[0] - 20.5).abs() < 0.2);
        assert!((first[1] - 103.5).abs() < 0.2);
    }

}  // mod tests.
