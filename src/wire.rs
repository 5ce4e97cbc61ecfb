// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Decoders for the service's response bodies. Anything that does not have
//! the expected shape is reported as a DataLoss error.

use canonical_error::{CanonicalError, data_loss_error, failed_precondition_error,
                      unauthenticated_error};
use log::warn;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::fits_header::{CARD_LEN, Header, HeaderCard};
use crate::solver_trait::{Annotation, JobId, JobStatus, Session, SubmissionId,
                          SubmissionStatus};

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: Option<String>,
    errormessage: Option<String>,
    session: Option<String>,
    subid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SubmissionReply {
    #[serde(default)]
    jobs: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct JobReply {
    status: String,
}

#[derive(Debug, Deserialize)]
struct AnnotationsReply {
    annotations: Vec<AnnotationRecord>,
}

#[derive(Debug, Deserialize)]
struct AnnotationRecord {
    #[serde(default)]
    names: Vec<String>,
    pixelx: Option<f64>,
    pixely: Option<f64>,
}

fn parse<T: DeserializeOwned>(body: &str, what: &str) -> Result<T, CanonicalError> {
    serde_json::from_str(body).map_err(|e| data_loss_error(
        format!("Malformed {} response ({}): {:?}", what, e, truncated(body)).as_str()))
}

fn truncated(body: &str) -> String {
    body.chars().take(200).collect()
}

// Server-side failure text, for error messages.
fn reason(reply: &StatusReply) -> String {
    reply.errormessage.clone()
        .or_else(|| reply.status.clone())
        .unwrap_or_else(|| "no status".to_string())
}

pub fn decode_login(body: &str) -> Result<Session, CanonicalError> {
    let reply: StatusReply = parse(body, "login")?;
    if reply.status.as_deref() != Some("success") {
        return Err(unauthenticated_error(
            format!("Login rejected: {}", reason(&reply)).as_str()));
    }
    match reply.session {
        Some(session) if !session.is_empty() => Ok(Session(session)),
        _ => Err(data_loss_error("Login response has no session")),
    }
}

pub fn decode_upload(body: &str) -> Result<SubmissionId, CanonicalError> {
    let reply: StatusReply = parse(body, "upload")?;
    if reply.status.as_deref() != Some("success") {
        return Err(failed_precondition_error(
            format!("Upload rejected: {}", reason(&reply)).as_str()));
    }
    reply.subid.map(SubmissionId).ok_or_else(
        || data_loss_error("Upload response has no submission id"))
}

// An empty job list, or one holding only null, means no job yet.
pub fn decode_submission(body: &str) -> Result<SubmissionStatus, CanonicalError> {
    let reply: SubmissionReply = parse(body, "submission")?;
    match reply.jobs.iter().flatten().next() {
        Some(job) => Ok(SubmissionStatus::JobAssigned(JobId(*job))),
        None => Ok(SubmissionStatus::Processing),
    }
}

pub fn decode_job(body: &str) -> Result<JobStatus, CanonicalError> {
    let reply: JobReply = parse(body, "job")?;
    Ok(match reply.status.as_str() {
        "success" => JobStatus::Success,
        "failure" => JobStatus::Failure,
        "error" => JobStatus::Error,
        other => JobStatus::Processing(other.to_string()),
    })
}

/// The WCS file is a FITS header with no line breaks: consecutive 80
/// character cards ending with END.
pub fn decode_wcs(body: &str) -> Result<Header, CanonicalError> {
    let blob = body.split('\n').next().unwrap_or("").trim_end_matches('\r');
    if blob.trim().is_empty() {
        return Err(data_loss_error("Empty WCS file"));
    }
    if !blob.is_ascii() {
        return Err(data_loss_error("WCS file is not ASCII"));
    }
    let mut header = Header::new();
    let mut saw_end = false;
    for chunk in blob.as_bytes().chunks(CARD_LEN) {
        // ASCII was checked above, so every chunk boundary is a char boundary.
        let card = std::str::from_utf8(chunk).map_err(
            |e| data_loss_error(format!("Bad WCS card: {:?}", e).as_str()))?;
        if card.trim().is_empty() {
            continue;
        }
        if card.trim_end() == "END" {
            saw_end = true;
            break;
        }
        header.push(HeaderCard::parse(card)?);
    }
    if !saw_end {
        warn!("WCS file has no END card");
    }
    if header.is_empty() {
        return Err(data_loss_error("WCS file has no cards"));
    }
    Ok(header)
}

/// Records without a name or pixel position are skipped.
pub fn decode_annotations(body: &str) -> Result<Vec<Annotation>, CanonicalError> {
    let reply: AnnotationsReply = parse(body, "annotations")?;
    let mut annotations = Vec::with_capacity(reply.annotations.len());
    for record in reply.annotations {
        let (Some(name), Some(pixel_x), Some(pixel_y)) =
            (record.names.first(), record.pixelx, record.pixely) else {
            warn!("Skipping incomplete annotation {:?}", record);
            continue;
        };
        annotations.push(Annotation{name: decode_unicode_escapes(name),
                                    pixel_x, pixel_y});
    }
    Ok(annotations)
}

/// Decodes `\uXXXX` sequences left in a string that was escaped twice.
/// Malformed sequences are kept as is.
pub fn decode_unicode_escapes(text: &str) -> String {
    if !text.contains("\\u") {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if let Some(unit) = escape_at(&chars, i) {
            // Surrogate pair.
            if (0xd800..0xdc00).contains(&unit) {
                if let Some(low) = escape_at(&chars, i + 6) {
                    if (0xdc00..0xe000).contains(&low) {
                        let code = 0x10000 + ((unit - 0xd800) << 10) + (low - 0xdc00);
                        if let Some(ch) = char::from_u32(code) {
                            out.push(ch);
                            i += 12;
                            continue;
                        }
                    }
                }
            } else if let Some(ch) = char::from_u32(unit) {
                out.push(ch);
                i += 6;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

// Value of a \uXXXX escape starting at chars[i].
fn escape_at(chars: &[char], i: usize) -> Option<u32> {
    if i + 6 > chars.len() || chars[i] != '\\' || chars[i + 1] != 'u' {
        return None;
    }
    let hex: String = chars[i + 2..i + 6].iter().collect();
    u32::from_str_radix(&hex, 16).ok()
}

// mod tests.
