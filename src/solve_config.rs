// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};
use imageproc::rect::Rect;

use crate::centroid::Aperture;
use crate::wcs_merge::AnnotationStyle;

pub const PUBLIC_URL: &str = "http://nova.astrometry.net";
pub const DEFAULT_ALTERNATE_URL: &str = "http://127.0.0.1:8080";

#[derive(Clone, Debug, PartialEq)]
pub enum ServerEndpoint {
    // The public nova.astrometry.net service. Requires an API key.
    Public,
    // A self-hosted service speaking the same API, e.g. a local
    // astrometry.net install. The API key may be empty.
    Alternate(String),
}

impl ServerEndpoint {
    pub fn base_url(&self) -> &str {
        match self {
            ServerEndpoint::Public => PUBLIC_URL,
            ServerEndpoint::Alternate(url) => url.trim_end_matches('/'),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, ServerEndpoint::Public)
    }

    // How long to wait for a submission or job on this endpoint before
    // resubmitting. The public service has a long queue; a local one is
    // either working or broken.
    pub fn default_poll_timeout(&self) -> Duration {
        match self {
            ServerEndpoint::Public => Duration::from_secs(600),
            ServerEndpoint::Alternate(_) => Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleHint {
    // Arcseconds per pixel, and the +/- tolerance on it.
    pub estimate: f64,
    pub tolerance: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkyHint {
    // Degrees.
    pub ra: f64,
    pub dec: f64,
    pub radius: f64,
}

// Which slices of the stack a run solves. Indices are zero based.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SliceSelection {
    All,
    Current(usize),
    // Inclusive; clamped to the stack.
    Range{first: usize, last: usize},
}

/// Everything a solve run needs to know. Built once per run and not changed
/// while the run is active.
#[derive(Clone, Debug)]
pub struct SolveConfig {
    pub endpoint: ServerEndpoint,
    pub api_key: String,

    // Median filter radius applied before detection; None to skip.
    pub median_filter_radius: Option<f64>,

    // Peak detection tolerance as a multiple of the slice's standard
    // deviation.
    pub noise_tolerance_sigma: f64,
    pub max_peak_value: Option<f64>,
    pub exclude_edges: bool,
    pub roi: Option<Rect>,

    // Brightest N candidates are uploaded.
    pub max_sources: usize,

    // Refine candidates with an aperture centroid; None uploads the peak
    // pixel centers.
    pub centroid: Option<Aperture>,

    pub scale: Option<ScaleHint>,
    pub sky_position: Option<SkyHint>,

    // SIP distortion order to fit; clamped to 2..=9. None disables.
    pub distortion_order: Option<u32>,

    // Resubmissions allowed per slice after the first attempt.
    pub max_retries: u32,
    pub poll_interval: Duration,
    // None means the endpoint's default.
    pub submission_timeout: Option<Duration>,
    pub job_timeout: Option<Duration>,
    // Bound on each individual HTTP request.
    pub request_timeout: Duration,

    pub slices: SliceSelection,
    pub skip_if_solved: bool,

    // Fetch the objects in the solved field and record them as ANNOTATE
    // cards.
    pub annotate: bool,
    pub annotation_style: AnnotationStyle,

    // Ask the header store to save each solved slice.
    pub persist: bool,
}

impl Default for SolveConfig {
    fn default() -> Self {
        SolveConfig{
            endpoint: ServerEndpoint::Public,
            api_key: String::new(),
            median_filter_radius: Some(2.0),
            noise_tolerance_sigma: 1.0,
            max_peak_value: None,
            exclude_edges: true,
            roi: None,
            max_sources: 50,
            centroid: None,
            scale: None,
            sky_position: None,
            distortion_order: Some(2),
            max_retries: 1,
            poll_interval: Duration::from_secs(1),
            submission_timeout: None,
            job_timeout: None,
            request_timeout: Duration::from_secs(60),
            slices: SliceSelection::All,
            skip_if_solved: true,
            annotate: true,
            annotation_style: AnnotationStyle{radius: 30.0, color: "orange".to_string()},
            persist: false,
        }
    }
}

impl SolveConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        match &self.endpoint {
            ServerEndpoint::Public => {
                if self.api_key.trim().is_empty() {
                    return Err(invalid_argument_error(
                        "An API key is required for the public astrometry.net service"));
                }
            },
            ServerEndpoint::Alternate(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid_argument_error(
                        format!("Server URL must start with http:// or https://; got {:?}",
                                url).as_str()));
                }
            },
        }
        if let Some(radius) = self.median_filter_radius {
            if radius <= 0.0 {
                return Err(invalid_argument_error(
                    format!("median_filter_radius must be positive; got {}",
                            radius).as_str()));
            }
        }
        if !(self.noise_tolerance_sigma >= 0.0) {
            return Err(invalid_argument_error(
                format!("noise_tolerance_sigma must be non-negative; got {}",
                        self.noise_tolerance_sigma).as_str()));
        }
        if self.max_sources == 0 {
            return Err(invalid_argument_error("max_sources must be at least 1"));
        }
        if let Some(aperture) = &self.centroid {
            if aperture.radius <= 0.0 {
                return Err(invalid_argument_error(
                    format!("Aperture radius must be positive; got {}",
                            aperture.radius).as_str()));
            }
        }
        if let Some(scale) = &self.scale {
            if scale.estimate <= 0.0 || scale.tolerance < 0.0 ||
                scale.tolerance >= scale.estimate {
                return Err(invalid_argument_error(
                    format!("Scale must be positive with tolerance in [0, estimate); \
                             got {} +/- {}", scale.estimate, scale.tolerance).as_str()));
            }
        }
        if let Some(sky) = &self.sky_position {
            if !(0.0..360.0).contains(&sky.ra) || !(-90.0..=90.0).contains(&sky.dec) {
                return Err(invalid_argument_error(
                    format!("Sky position out of range; got ra {} dec {}",
                            sky.ra, sky.dec).as_str()));
            }
            if sky.radius <= 0.0 || sky.radius > 180.0 {
                return Err(invalid_argument_error(
                    format!("Search radius must be in (0, 180] degrees; got {}",
                            sky.radius).as_str()));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(invalid_argument_error("poll_interval must be non-zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid_argument_error("request_timeout must be non-zero"));
        }
        if let SliceSelection::Range{first, last} = self.slices {
            if first > last {
                return Err(invalid_argument_error(
                    format!("Empty slice range {}..={}", first + 1, last + 1).as_str()));
            }
        }
        Ok(())
    }

    pub fn submission_timeout(&self) -> Duration {
        self.submission_timeout.unwrap_or(self.endpoint.default_poll_timeout())
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout.unwrap_or(self.endpoint.default_poll_timeout())
    }

    // Value sent as tweak_order; 0 asks for no distortion fit.
    pub fn tweak_order(&self) -> u32 {
        match self.distortion_order {
            Some(order) => order.clamp(2, 9),
            None => 0,
        }
    }
}

// mod tests.
