use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::{CanonicalError, invalid_argument_error};
use log::{error, info, warn};

use crate::header_store::HeaderStore;
use crate::image_utils::ImageStack;
use crate::progress::{ProgressSink, SliceProgress, SolveOutcome};
use crate::slice_solver::{SliceReport, SliceSolver};
use crate::solve_config::{SliceSelection, SolveConfig};
use crate::solver_trait::{FailureKind, SolverTrait, failure_kind};

/// Solves the slices of `image` chosen by `config.slices`, one after the
/// other, over a single login session.
///
/// A slice that fails does not stop the run. The result is that slice's
/// outcome for a single slice run; otherwise Failed only if the last slice
/// failed, Canceled if `cancel` was set, and Success in all other cases.
/// Returns an error only for invalid configuration.
pub fn run(service: &dyn SolverTrait,
           image: &dyn ImageStack,
           headers: &mut dyn HeaderStore,
           config: &SolveConfig,
           cancel: &AtomicBool,
           progress: &dyn ProgressSink) -> Result<SolveOutcome, CanonicalError> {
    run_with_reports(service, image, headers, config, cancel, progress,
                     &mut |_slice, _report| {})
}

/// As run(), also handing each slice's report to `on_slice` as it finishes.
pub fn run_with_reports(service: &dyn SolverTrait,
                        image: &dyn ImageStack,
                        headers: &mut dyn HeaderStore,
                        config: &SolveConfig,
                        cancel: &AtomicBool,
                        progress: &dyn ProgressSink,
                        on_slice: &mut dyn FnMut(usize, &SliceReport))
                        -> Result<SolveOutcome, CanonicalError> {
    config.validate()?;
    let slices = selected_slices(config.slices, image.slice_count())?;
    let finish = |outcome: SolveOutcome| -> Result<SolveOutcome, CanonicalError> {
        progress.finished(outcome);
        Ok(outcome)
    };
    if cancel.load(Ordering::Relaxed) {
        return finish(SolveOutcome::Canceled);
    }

    progress.status(format!("Logging in to {}", config.endpoint.base_url()).as_str());
    let session = match service.authenticate(&config.api_key) {
        Ok(session) => session,
        Err(e) => {
            if failure_kind(&e) == FailureKind::Config {
                return Err(e);
            }
            if cancel.load(Ordering::Relaxed) {
                return finish(SolveOutcome::Canceled);
            }
            error!("Login to {} failed: {}", config.endpoint.base_url(), e.message);
            progress.status(format!("Login failed: {}", e.message).as_str());
            return finish(SolveOutcome::Failed);
        }
    };

    let count = slices.len();
    let (mut solved, mut skipped, mut failed) = (0, 0, 0);
    let mut last_outcome = SolveOutcome::Success;
    for (ordinal, &slice) in slices.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return finish(SolveOutcome::Canceled);
        }
        let label = image.slice_label(slice);
        let slice_progress = SliceProgress::new(progress, &label, ordinal + 1, count);
        let report = SliceSolver::new(service, &session, config, cancel, &slice_progress)
            .solve(image, slice, headers);
        on_slice(slice, &report);
        match report.outcome {
            SolveOutcome::Canceled => {
                info!("Solve canceled at {}", label);
                return finish(SolveOutcome::Canceled);
            },
            SolveOutcome::Success => solved += 1,
            SolveOutcome::Skipped => skipped += 1,
            SolveOutcome::Failed => {
                failed += 1;
                if ordinal + 1 < count {
                    warn!("Could not solve {}; continuing with the next slice", label);
                }
            },
        }
        last_outcome = report.outcome;
    }
    info!("Solved {} of {} slices ({} skipped, {} failed)", solved, count, skipped, failed);

    let outcome = if count == 1 {
        last_outcome
    } else if last_outcome == SolveOutcome::Failed {
        SolveOutcome::Failed
    } else {
        SolveOutcome::Success
    };
    finish(outcome)
}

/// Zero based indices of the slices to solve, in order. A range is clamped
/// to the stack; a range or current slice entirely outside it is an error.
pub fn selected_slices(selection: SliceSelection, slice_count: usize)
                       -> Result<Vec<usize>, CanonicalError> {
    if slice_count == 0 {
        return Err(invalid_argument_error("Image has no slices"));
    }
    match selection {
        SliceSelection::All => Ok((0..slice_count).collect()),
        SliceSelection::Current(index) => {
            if index >= slice_count {
                return Err(invalid_argument_error(
                    format!("Slice {} requested; image has {} slices",
                            index + 1, slice_count).as_str()));
            }
            Ok(vec![index])
        },
        SliceSelection::Range{first, last} => {
            if first >= slice_count || first > last {
                return Err(invalid_argument_error(
                    format!("Slice range {}..{} is outside the {} slices of the image",
                            first + 1, last + 1, slice_count).as_str()));
            }
            Ok((first..=last.min(slice_count - 1)).collect())
        },
    }
}

// mod tests.
