//! Test doubles shared by the slice, stack and engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::{CanonicalError, data_loss_error, deadline_exceeded_error,
                      failed_precondition_error, not_found_error,
                      unauthenticated_error, unavailable_error};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::fits_header::{Header, HeaderCard};
use crate::image_utils::FloatImage;
use crate::solver_trait::{Annotation, JobId, JobStatus, Session, SolverTrait,
                          SubmissionId, SubmissionStatus};
use crate::source_list::UploadPayload;

// Ways a scripted call can go wrong.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Fault {
    Transport,
    Timeout,
    Rejected,
    NotFound,
    Malformed,
}

impl Fault {
    fn error(&self, what: &str) -> CanonicalError {
        match self {
            Fault::Transport => unavailable_error(what),
            Fault::Timeout => deadline_exceeded_error(what),
            Fault::Rejected => failed_precondition_error(what),
            Fault::NotFound => not_found_error(what),
            Fault::Malformed => data_loss_error(what),
        }
    }
}

type Reply<T> = Result<T, Fault>;

// Pops the next scripted reply; the last one repeats forever.
fn next_reply<T: Clone>(queue: &mut VecDeque<Reply<T>>) -> Option<Reply<T>> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

struct FakeState {
    login: Reply<String>,
    next_submission: u64,
    submit_faults: VecDeque<Fault>,
    // Keyed by submission id. Unscripted submissions are assigned job
    // number == submission number at once.
    submission_replies: HashMap<u64, VecDeque<Reply<SubmissionStatus>>>,
    // Keyed by job id. Unscripted jobs succeed at once.
    job_replies: HashMap<u64, VecDeque<Reply<JobStatus>>>,
    wcs: Reply<Header>,
    annotations: Reply<Vec<Annotation>>,
    payloads: Vec<UploadPayload>,
    calls: Vec<String>,
    // Sets the flag when the named call is made.
    cancel_on: Option<(String, Arc<AtomicBool>)>,
}

/// In-memory SolverTrait driven by scripted replies. Records every call.
pub struct FakeSolver {
    state: Mutex<FakeState>,
}

impl FakeSolver {
    pub fn new() -> Self {
        FakeSolver{state: Mutex::new(FakeState{
            login: Ok("session-1".to_string()),
            next_submission: 1,
            submit_faults: VecDeque::new(),
            submission_replies: HashMap::new(),
            job_replies: HashMap::new(),
            wcs: Ok(solution_header(20)),
            annotations: Ok(Vec::new()),
            payloads: Vec::new(),
            calls: Vec::new(),
            cancel_on: None,
        })}
    }

    pub fn fail_login(self, fault: Fault) -> Self {
        self.state.lock().unwrap().login = Err(fault);
        self
    }

    // The next submit() calls fail, in order.
    pub fn fail_submits(self, faults: &[Fault]) -> Self {
        self.state.lock().unwrap().submit_faults.extend(faults.iter().copied());
        self
    }

    pub fn script_submission(self, submission: u64,
                             replies: Vec<Reply<SubmissionStatus>>) -> Self {
        self.state.lock().unwrap().submission_replies.insert(
            submission, replies.into());
        self
    }

    pub fn script_job(self, job: u64, replies: Vec<Reply<JobStatus>>) -> Self {
        self.state.lock().unwrap().job_replies.insert(job, replies.into());
        self
    }

    pub fn wcs(self, wcs: Reply<Header>) -> Self {
        self.state.lock().unwrap().wcs = wcs;
        self
    }

    pub fn annotations(self, annotations: Reply<Vec<Annotation>>) -> Self {
        self.state.lock().unwrap().annotations = annotations;
        self
    }

    pub fn cancel_on(self, call: &str, flag: Arc<AtomicBool>) -> Self {
        self.state.lock().unwrap().cancel_on = Some((call.to_string(), flag));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    // Number of calls whose log entry starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn payloads(&self) -> Vec<UploadPayload> {
        self.state.lock().unwrap().payloads.clone()
    }

    fn record(state: &mut FakeState, call: String) {
        if let Some((name, flag)) = &state.cancel_on {
            if call.starts_with(name.as_str()) {
                flag.store(true, Ordering::Relaxed);
            }
        }
        state.calls.push(call);
    }
}

impl SolverTrait for FakeSolver {
    fn authenticate(&self, api_key: &str) -> Result<Session, CanonicalError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("authenticate {}", api_key));
        match &state.login {
            Ok(session) => Ok(Session(session.clone())),
            Err(Fault::Rejected) => Err(unauthenticated_error("bad api key")),
            Err(fault) => Err(fault.error("login")),
        }
    }

    fn submit(&self, _session: &Session, payload: &UploadPayload)
              -> Result<SubmissionId, CanonicalError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "submit".to_string());
        if let Some(fault) = state.submit_faults.pop_front() {
            return Err(fault.error("upload"));
        }
        state.payloads.push(payload.clone());
        let id = state.next_submission;
        state.next_submission += 1;
        Ok(SubmissionId(id))
    }

    fn poll_submission(&self, submission: SubmissionId)
                       -> Result<SubmissionStatus, CanonicalError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("poll_submission {}", submission));
        let reply = match state.submission_replies.get_mut(&submission.0) {
            Some(queue) => next_reply(queue),
            None => None,
        };
        match reply.unwrap_or(Ok(SubmissionStatus::JobAssigned(JobId(submission.0)))) {
            Ok(status) => Ok(status),
            Err(fault) => Err(fault.error("submission status")),
        }
    }

    fn poll_job(&self, job: JobId) -> Result<JobStatus, CanonicalError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("poll_job {}", job));
        let reply = match state.job_replies.get_mut(&job.0) {
            Some(queue) => next_reply(queue),
            None => None,
        };
        match reply.unwrap_or(Ok(JobStatus::Success)) {
            Ok(status) => Ok(status),
            Err(fault) => Err(fault.error("job status")),
        }
    }

    fn fetch_wcs(&self, job: JobId) -> Result<Header, CanonicalError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("fetch_wcs {}", job));
        match &state.wcs {
            Ok(header) => Ok(header.clone()),
            Err(fault) => Err(fault.error("wcs")),
        }
    }

    fn fetch_annotations(&self, job: JobId) -> Result<Vec<Annotation>, CanonicalError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("fetch_annotations {}", job));
        match &state.annotations {
            Ok(annotations) => Ok(annotations.clone()),
            Err(fault) => Err(fault.error("annotations")),
        }
    }
}

/// A WCS block as the service returns it: `num_wcs` WCS cards (at least 11,
/// at most 23 + SIP terms) mixed with cards that are not WCS keywords.
pub fn solution_header(num_wcs: usize) -> Header {
    let mut cards = vec![
        HeaderCard::logical("SIMPLE", true, None),
        HeaderCard::int("WCSAXES", 2, Some("no comment")),
        HeaderCard::string("CTYPE1", "RA---TAN-SIP", Some("TAN (gnomic) projection + SIP")),
        HeaderCard::string("CTYPE2", "DEC--TAN-SIP", Some("TAN (gnomic) projection + SIP")),
        HeaderCard::new("CRVAL1", "83.8220833", Some("RA  of reference point")),
        HeaderCard::new("CRVAL2", "-5.39111111", Some("DEC of reference point")),
        HeaderCard::new("CRPIX1", "64.5", Some("X reference pixel")),
        HeaderCard::new("CRPIX2", "64.5", Some("Y reference pixel")),
        HeaderCard::new("CD1_1", "-2.9E-4", None),
        HeaderCard::new("CD1_2", "1.1E-6", None),
        HeaderCard::new("CD2_1", "-1.1E-6", None),
        HeaderCard::new("CD2_2", "-2.9E-4", None),
        HeaderCard::commentary("COMMENT", "Tweak: yes"),
    ];
    let extra = [
        HeaderCard::string("CUNIT1", "deg", None),
        HeaderCard::string("CUNIT2", "deg", None),
        HeaderCard::new("EQUINOX", "2000.0", None),
        HeaderCard::new("LONPOLE", "180.0", None),
        HeaderCard::new("LATPOLE", "0.0", None),
        HeaderCard::int("IMAGEW", 128, None),
        HeaderCard::int("IMAGEH", 128, None),
        HeaderCard::int("A_ORDER", 2, None),
        HeaderCard::new("A_0_2", "1.2E-7", None),
        HeaderCard::new("A_1_1", "-3.0E-8", None),
        HeaderCard::new("A_2_0", "4.4E-7", None),
        HeaderCard::int("B_ORDER", 2, None),
        HeaderCard::new("B_0_2", "2.2E-7", None),
        HeaderCard::new("B_1_1", "5.0E-8", None),
        HeaderCard::new("B_2_0", "-1.4E-7", None),
    ];
    let wanted = num_wcs.saturating_sub(11).min(extra.len());
    cards.extend(extra.into_iter().take(wanted));
    cards.push(HeaderCard::commentary("COMMENT", "scale: 1.04 arcsec/pix"));
    Header::from_cards(cards)
}

/// `stars` are (x, y, amplitude) Gaussians with sigma 1.5 on a background
/// of 100 with +/- 5 uniform noise.
pub fn star_field(width: usize, height: usize, stars: &[(f64, f64, f64)],
                  seed: u64) -> FloatImage {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut image = FloatImage::filled(width, height, 0.0);
    for y in 0..height {
        for x in 0..width {
            let mut value = 100.0 + rng.gen_range(-5.0..5.0);
            for &(sx, sy, amplitude) in stars {
                let dx = x as f64 + 0.5 - sx;
                let dy = y as f64 + 0.5 - sy;
                value += amplitude * (-(dx * dx + dy * dy) / 4.5).exp();
            }
            image.set(x, y, value as f32);
        }
    }
    image
}

/// Twelve well separated stars, brightest first.
pub fn twelve_stars() -> Vec<(f64, f64, f64)> {
    let mut stars = Vec::new();
    for i in 0..12 {
        let col = (i % 4) as f64;
        let row = (i / 4) as f64;
        stars.push((20.5 + 28.0 * col, 24.5 + 36.0 * row, 2000.0 - 100.0 * i as f64));
    }
    stars
}
