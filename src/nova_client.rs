// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error, internal_error, not_found_error,
                      unauthenticated_error, unavailable_error};
use log::{debug, info};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, multipart};
use serde_json::json;

use crate::fits_header::Header;
use crate::solve_config::ServerEndpoint;
use crate::solver_trait::{Annotation, JobId, JobStatus, Session, SolverTrait,
                          SubmissionId, SubmissionStatus};
use crate::source_list::{SOURCE_TABLE_NAME, UploadPayload};
use crate::wire;

/// SolverTrait implementation speaking the astrometry.net JSON API over HTTP.
pub struct NovaClient {
    base_url: String,
    client: Client,
}

impl NovaClient {
    pub fn new(endpoint: &ServerEndpoint, request_timeout: Duration)
               -> Result<Self, CanonicalError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| internal_error(
                format!("Could not create HTTP client: {:?}", e).as_str()))?;
        Ok(NovaClient{base_url: endpoint.base_url().to_string(), client})
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // Sends the request and returns the body of a 2xx response.
    fn send(&self, request: RequestBuilder, what: &str) -> Result<String, CanonicalError> {
        let response = request.send().map_err(|e| transport_error(&e, what))?;
        let status = response.status();
        let body = response.text().map_err(|e| transport_error(&e, what))?;
        if status.is_success() {
            debug!("{} response: {}", what, body.chars().take(300).collect::<String>());
            return Ok(body);
        }
        let message = format!("{} failed with HTTP {}", what, status);
        if status == StatusCode::NOT_FOUND {
            Err(not_found_error(message.as_str()))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(unauthenticated_error(message.as_str()))
        } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT ||
            status == StatusCode::TOO_MANY_REQUESTS {
            Err(unavailable_error(message.as_str()))
        } else {
            Err(failed_precondition_error(message.as_str()))
        }
    }
}

fn transport_error(e: &reqwest::Error, what: &str) -> CanonicalError {
    let message = format!("{} request failed: {}", what, e);
    if e.is_timeout() {
        deadline_exceeded_error(message.as_str())
    } else {
        unavailable_error(message.as_str())
    }
}

impl SolverTrait for NovaClient {
    fn authenticate(&self, api_key: &str) -> Result<Session, CanonicalError> {
        let request_json = json!({"apikey": api_key});
        let body = self.send(
            self.client.post(self.url("/api/login"))
                .form(&[("request-json", request_json.to_string())]),
            "Login")?;
        let session = wire::decode_login(&body)?;
        info!("Logged in to {}", self.base_url);
        Ok(session)
    }

    fn submit(&self, _session: &Session, payload: &UploadPayload)
              -> Result<SubmissionId, CanonicalError> {
        // The session travels inside request_json.
        let table = multipart::Part::text(payload.source_table.clone())
            .file_name(SOURCE_TABLE_NAME)
            .mime_str("application/octet-stream")
            .map_err(|e| internal_error(format!("Bad mime type: {:?}", e).as_str()))?;
        let form = multipart::Form::new()
            .text("request-json", payload.request_json.clone())
            .part("file", table);
        let body = self.send(
            self.client.post(self.url("/api/upload")).multipart(form), "Upload")?;
        let submission = wire::decode_upload(&body)?;
        info!("Uploaded {} sources as submission {}", payload.num_sources, submission);
        Ok(submission)
    }

    fn poll_submission(&self, submission: SubmissionId)
                       -> Result<SubmissionStatus, CanonicalError> {
        let body = self.send(
            self.client.get(self.url(format!("/api/submissions/{}", submission).as_str())),
            "Submission status")?;
        wire::decode_submission(&body)
    }

    fn poll_job(&self, job: JobId) -> Result<JobStatus, CanonicalError> {
        let body = self.send(
            self.client.get(self.url(format!("/api/jobs/{}", job).as_str())),
            "Job status")?;
        wire::decode_job(&body)
    }

    fn fetch_wcs(&self, job: JobId) -> Result<Header, CanonicalError> {
        let body = self.send(
            self.client.get(self.url(format!("/wcs_file/{}", job).as_str())),
            "WCS download")?;
        wire::decode_wcs(&body)
    }

    fn fetch_annotations(&self, job: JobId) -> Result<Vec<Annotation>, CanonicalError> {
        let body = self.send(
            self.client.get(self.url(format!("/api/jobs/{}/annotations", job).as_str())),
            "Annotations")?;
        wire::decode_annotations(&body)
    }
}

// mod tests.
