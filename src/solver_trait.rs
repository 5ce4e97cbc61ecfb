// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::{CanonicalError, CanonicalErrorCode};

use crate::fits_header::Header;
use crate::source_list::UploadPayload;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImagePos {
    // The upper-left corner is 0, 0. The center of the upper-left pixel is
    // 0.5, 0.5.
    pub x: f64,
    pub y: f64,
}

impl From<ImagePos> for [f64; 2] {
    fn from(pos: ImagePos) -> Self {
        [pos.x, pos.y]
    }
}
impl From<[f64; 2]> for ImagePos {
    fn from(pos: [f64; 2]) -> Self {
        ImagePos{x: pos[0], y: pos[1]}
    }
}

// Token returned by the service's login call. Valid for the whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmissionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionStatus {
    // No job has been started for the submission yet.
    Processing,
    JobAssigned(JobId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    // Queued or solving; carries the server's status string.
    Processing(String),
    Success,
    Failure,
    Error,
}

// A named object the service found in the solved field.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub name: String,
    pub pixel_x: f64,
    pub pixel_y: f64,
}

/// How the solve pipeline reacts to an error returned by a SolverTrait
/// operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    // Bad configuration. Fatal for the run, never retried.
    Config,
    // Network failure or request timeout.
    Transport,
    // The service answered but refused: bad key, rejected upload, unknown
    // submission, failed job.
    Rejected,
    // The response could not be decoded. Fatal for the slice.
    Malformed,
}

pub fn failure_kind(error: &CanonicalError) -> FailureKind {
    match error.code {
        CanonicalErrorCode::InvalidArgument => FailureKind::Config,
        CanonicalErrorCode::Unavailable |
        CanonicalErrorCode::DeadlineExceeded => FailureKind::Transport,
        CanonicalErrorCode::DataLoss => FailureKind::Malformed,
        _ => FailureKind::Rejected,
    }
}

// Client side of a remote plate-solving service. Each method is a single
// blocking round trip with its own request timeout; none of them retry. The
// error code tells the caller what went wrong (see failure_kind()):
//   Unavailable, DeadlineExceeded: transport failure or request timeout.
//   DataLoss: the response body could not be decoded.
//   Unauthenticated: the API key was rejected.
//   FailedPrecondition: the service refused the request.
//   NotFound: unknown submission or job.
pub trait SolverTrait {
    fn authenticate(&self, api_key: &str) -> Result<Session, CanonicalError>;

    fn submit(&self, session: &Session, payload: &UploadPayload)
              -> Result<SubmissionId, CanonicalError>;

    fn poll_submission(&self, submission: SubmissionId)
                       -> Result<SubmissionStatus, CanonicalError>;

    fn poll_job(&self, job: JobId) -> Result<JobStatus, CanonicalError>;

    // The WCS solution for a successful job, as header cards.
    fn fetch_wcs(&self, job: JobId) -> Result<Header, CanonicalError>;

    fn fetch_annotations(&self, job: JobId)
                         -> Result<Vec<Annotation>, CanonicalError>;
}

// mod tests.
