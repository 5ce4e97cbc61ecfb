// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, internal_error, invalid_argument_error};
use clap::Parser;
use log::{error, info};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use nova_solve::centroid::Aperture;
use nova_solve::header_store::SidecarHeaderStore;
use nova_solve::image_utils::{FileStack, ImageStack};
use nova_solve::nova_client::NovaClient;
use nova_solve::progress::{LogProgress, SolveOutcome};
use nova_solve::solve_config::{ScaleHint, ServerEndpoint, SkyHint, SliceSelection,
                               SolveConfig};
use nova_solve::solve_engine::{SolveEngine, SolveJob, StartPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Image files, one per slice. Existing headers are read from sidecar
    /// files with the same name and a .hdr extension.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// astrometry.net API key. Falls back to the NOVA_API_KEY environment
    /// variable.
    #[arg(long)]
    api_key: Option<String>,

    /// Base URL of a self-hosted astrometry.net service. The public
    /// nova.astrometry.net service is used if omitted.
    #[arg(long)]
    server_url: Option<String>,

    /// Solve only this slice (1 based).
    #[arg(long, conflicts_with_all = ["first_slice", "last_slice"])]
    slice: Option<usize>,

    /// First slice to solve (1 based).
    #[arg(long)]
    first_slice: Option<usize>,

    /// Last slice to solve (1 based). Clamped to the number of slices.
    #[arg(long)]
    last_slice: Option<usize>,

    /// Peak detection tolerance, in standard deviations of the image.
    #[arg(long, default_value = "1.0")]
    tolerance: f64,

    /// Ignore maxima at or above this pixel value.
    #[arg(long)]
    max_peak: Option<f64>,

    /// Keep maxima whose surroundings touch the image border.
    #[arg(long)]
    include_edges: bool,

    /// Number of brightest sources uploaded.
    #[arg(long, default_value = "50")]
    max_sources: usize,

    /// Median filter radius, pixels.
    #[arg(long, default_value = "2.0")]
    median_radius: f64,

    /// Skip the median filter.
    #[arg(long)]
    no_median: bool,

    /// Refine source positions with an aperture centroid.
    #[arg(long)]
    centroid: bool,

    /// Centroid aperture radius, pixels.
    #[arg(long, default_value = "20.0")]
    aperture_radius: f64,

    /// Inner and outer radius of the centroid background annulus, pixels.
    #[arg(long, default_value = "30.0")]
    back_inner: f64,
    #[arg(long, default_value = "40.0")]
    back_outer: f64,

    /// Fit a plane to the centroid background.
    #[arg(long)]
    back_plane: bool,

    /// Image scale estimate, arcsec/pixel.
    #[arg(long)]
    scale: Option<f64>,

    /// Plus or minus tolerance on --scale, arcsec/pixel.
    #[arg(long, default_value = "0.1")]
    scale_error: f64,

    /// Approximate field center, degrees. Give both or neither.
    #[arg(long, requires = "dec")]
    ra: Option<f64>,
    #[arg(long, requires = "ra")]
    dec: Option<f64>,

    /// Search radius around --ra/--dec, degrees.
    #[arg(long, default_value = "40.0")]
    radius: f64,

    /// SIP distortion order (2 to 9); 0 disables distortion fitting.
    #[arg(long, default_value = "2")]
    distortion_order: u32,

    /// Resubmissions per slice after a failed attempt.
    #[arg(long, default_value = "1")]
    max_retries: u32,

    /// Time between status polls, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "1.0")]
    poll_interval: Duration,

    /// How long to wait for a submission or job before resubmitting,
    /// seconds. Defaults to 600 for the public service, 120 otherwise.
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Don't write object annotations into the header.
    #[arg(long)]
    no_annotate: bool,

    /// Save solved headers to a wcs/ directory next to the images.
    #[arg(long)]
    save: bool,

    /// Solve slices that already have a WCS solution.
    #[arg(long)]
    force: bool,

    /// Also log to a daily rotated file in this directory.
    #[arg(long)]
    log_dir: Option<String>,
}

// Adapted from
// https://stackoverflow.com/questions/72313616/using-claps-deriveparser-how-can-i-accept-a-stdtimeduration
fn parse_duration(arg: &str)
                  -> Result<std::time::Duration, std::num::ParseFloatError> {
    let seconds = arg.parse()?;
    Ok(std::time::Duration::from_secs_f64(seconds))
}

fn slice_selection(args: &Args) -> Result<SliceSelection, CanonicalError> {
    let one_based = |name: &str, value: usize| {
        if value == 0 {
            Err(invalid_argument_error(
                format!("--{} counts from 1", name).as_str()))
        } else {
            Ok(value - 1)
        }
    };
    if let Some(slice) = args.slice {
        return Ok(SliceSelection::Current(one_based("slice", slice)?));
    }
    if args.first_slice.is_none() && args.last_slice.is_none() {
        return Ok(SliceSelection::All);
    }
    let first = one_based("first-slice", args.first_slice.unwrap_or(1))?;
    let last = one_based("last-slice", args.last_slice.unwrap_or(usize::MAX))?;
    Ok(SliceSelection::Range{first, last})
}

fn solve_config(args: &Args) -> Result<SolveConfig, CanonicalError> {
    let endpoint = match &args.server_url {
        Some(url) => ServerEndpoint::Alternate(url.clone()),
        None => ServerEndpoint::Public,
    };
    let api_key = match &args.api_key {
        Some(key) => key.clone(),
        None => std::env::var("NOVA_API_KEY").unwrap_or_default(),
    };
    let mut config = SolveConfig{
        endpoint,
        api_key,
        median_filter_radius: if args.no_median { None } else { Some(args.median_radius) },
        noise_tolerance_sigma: args.tolerance,
        max_peak_value: args.max_peak,
        exclude_edges: !args.include_edges,
        max_sources: args.max_sources,
        scale: args.scale.map(|estimate| ScaleHint{estimate, tolerance: args.scale_error}),
        distortion_order: if args.distortion_order == 0 {
            None
        } else {
            Some(args.distortion_order)
        },
        max_retries: args.max_retries,
        poll_interval: args.poll_interval,
        submission_timeout: args.timeout,
        job_timeout: args.timeout,
        slices: slice_selection(args)?,
        skip_if_solved: !args.force,
        annotate: !args.no_annotate,
        persist: args.save,
        ..Default::default()
    };
    if args.centroid {
        config.centroid = Some(Aperture{radius: args.aperture_radius,
                                        back_inner: args.back_inner,
                                        back_outer: args.back_outer,
                                        back_plane: args.back_plane,
                                        ..Default::default()});
    }
    if let (Some(ra), Some(dec)) = (args.ra, args.dec) {
        config.sky_position = Some(SkyHint{ra, dec, radius: args.radius});
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<SolveOutcome, CanonicalError> {
    let config = solve_config(args)?;
    let image = FileStack::open(args.images.clone())?;
    info!("Solving {} slices of {}x{} pixels with {}",
          image.slice_count(), image.width(), image.height(),
          config.endpoint.base_url());
    let headers = SidecarHeaderStore::open(image.paths())?;
    let service = NovaClient::new(&config.endpoint, config.request_timeout)?;

    let engine = SolveEngine::new(100)?;
    let cancel = engine.cancel_flag();
    ctrlc::set_handler(move || {
        info!("Got control-c");
        cancel.store(true, Ordering::Relaxed);
    }).map_err(|e| internal_error(
        format!("Could not install control-c handler: {:?}", e).as_str()))?;

    engine.start(SolveJob{service: Box::new(service),
                          image: Box::new(image),
                          headers: Arc::new(Mutex::new(headers)),
                          config,
                          progress: Arc::new(LogProgress)},
                 StartPolicy::Reject)?;
    let result = match engine.wait() {
        Some(result) => result,
        None => Err(internal_error("Solve run produced no result")),
    };
    let stats = engine.stats();
    if stats.slices_solved > 0 {
        info!("Mean solve time {:.1}s, {:.1} submissions per slice",
              stats.slice_latency.mean, stats.submissions.mean);
    }
    result
}

fn exit_code(outcome: SolveOutcome) -> i32 {
    match outcome {
        SolveOutcome::Success | SolveOutcome::Skipped => 0,
        SolveOutcome::Failed => 1,
        SolveOutcome::Canceled => 130,
    }
}

fn main() {
    let args = Args::parse();

    // Set up logging.
    let (non_blocking_stdout, stdout_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let mut file_guard = None;
    let file_layer = match &args.log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "nova_solve.log");
            let (non_blocking_file, guard) = NonBlockingBuilder::default()
                .lossy(false)
                .finish(file_appender);
            file_guard = Some(guard);
            Some(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        },
        None => None,
    };
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(file_layer)
        .init();

    let code = match run(&args) {
        Ok(outcome) => {
            info!("Finished: {:?}", outcome);
            exit_code(outcome)
        },
        Err(e) => {
            error!("{}", e.message);
            2
        },
    };
    // Flush the log writers; process::exit() skips destructors.
    drop(file_guard);
    drop(stdout_guard);
    std::process::exit(code);
}
