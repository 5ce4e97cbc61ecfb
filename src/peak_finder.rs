//! Finds local intensity maxima that stand out from their surroundings by
//! more than a noise tolerance. A maximum is accepted only if no path of
//! pixels staying within `tolerance` of its value leads to a higher pixel;
//! this keeps noise bumps on the flank of a star from being reported as
//! separate sources.

use std::sync::atomic::{AtomicBool, Ordering};

use imageproc::rect::Rect;
use log::debug;

use crate::image_utils::FloatImage;
use crate::progress::ProgressSink;
use crate::solver_trait::ImagePos;

#[derive(Clone, Debug)]
pub struct PeakParams {
    // Minimum height, in pixel value units, of a maximum above the saddle
    // connecting it to any higher maximum.
    pub tolerance: f64,

    // Drop maxima whose tolerance region touches the image border.
    pub exclude_edges: bool,

    // Drop maxima at or above this value (saturated stars).
    pub max_peak_value: Option<f64>,
}

impl Default for PeakParams {
    fn default() -> Self {
        PeakParams{tolerance: 0.0, exclude_edges: true, max_peak_value: None}
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub pos: ImagePos,
    pub peak_value: f64,
}

// Neighbor offsets, clockwise starting north.
const DIR_X: [i64; 8] = [0, 1, 1, 1, 0, -1, -1, -1];
const DIR_Y: [i64; 8] = [-1, -1, 0, 1, 1, 1, 0, -1];

// Per-pixel marks used while flood filling.
const LISTED: u8 = 1;
const PROCESSED: u8 = 2;
const EQUAL: u8 = 4;

// Seed values are quantized to this range for sorting.
const SORT_RANGE: f64 = 2e9;

/// Returns the accepted maxima, brightest first. `roi` restricts where seeds
/// and reported maxima may lie; the flood fill still sees the whole image.
/// If `cancel` is set while running, returns an empty list.
pub fn find_peaks(image: &FloatImage,
                  roi: Option<Rect>,
                  params: &PeakParams,
                  cancel: &AtomicBool,
                  progress: &dyn ProgressSink) -> Vec<Candidate> {
    let width = image.width();
    let height = image.height();
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let Some((x0, y0, x1, y1)) = roi_bounds(roi, width, height) else {
        return Vec::new();
    };

    let (global_min, global_max) = min_max(image, x0, y0, x1, y1);
    if global_max <= global_min {
        return Vec::new();  // Flat.
    }
    let max_sorting_error = 1.1 * (global_max - global_min) / SORT_RANGE;

    progress.status("Finding local maxima");
    let Some(seeds) = sorted_seeds(image, (x0, y0, x1, y1), global_min, global_max,
                                   params.exclude_edges, cancel) else {
        return Vec::new();
    };
    debug!("{} local maxima seeds", seeds.len());

    progress.status("Analyzing maxima");
    let mut finder = FloodFill{
        image, width, height,
        tolerance: params.tolerance,
        exclude_edges: params.exclude_edges,
        max_sorting_error,
        marks: vec![0_u8; width * height],
        list: Vec::new(),
    };
    let mut candidates = Vec::new();
    for (n, key) in seeds.iter().rev().enumerate() {
        if n % 100 == 0 && cancel.load(Ordering::Relaxed) {
            return Vec::new();
        }
        let seed = (key & 0xffff_ffff) as usize;
        if finder.marks[seed] & PROCESSED != 0 {
            continue;  // Reached from a higher maximum already.
        }
        let Some(region) = finder.analyze(seed) else {
            continue;
        };
        let (px, py) = (region.pixel % width, region.pixel / width);
        if px < x0 || px >= x1 || py < y0 || py >= y1 {
            continue;
        }
        let peak_value = image.get(px, py) as f64;
        if let Some(limit) = params.max_peak_value {
            if peak_value >= limit {
                continue;
            }
        }
        candidates.push(Candidate{
            pos: ImagePos{x: region.x_equal + 0.5, y: region.y_equal + 0.5},
            peak_value,
        });
    }
    // Seeds were visited in quantized order; make the ranking exact.
    candidates.sort_by(|a, b| b.peak_value.total_cmp(&a.peak_value));
    candidates
}

fn roi_bounds(roi: Option<Rect>, width: usize, height: usize)
              -> Option<(usize, usize, usize, usize)> {
    let Some(roi) = roi else {
        return Some((0, 0, width, height));
    };
    let x0 = roi.left().max(0) as usize;
    let y0 = roi.top().max(0) as usize;
    let x1 = ((roi.right() + 1).max(0) as usize).min(width);
    let y1 = ((roi.bottom() + 1).max(0) as usize).min(height);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some((x0, y0, x1, y1))
}

fn min_max(image: &FloatImage, x0: usize, y0: usize, x1: usize, y1: usize) -> (f64, f64) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for y in y0..y1 {
        for x in x0..x1 {
            let v = image.get(x, y);
            if v < min { min = v; }
            if v > max { max = v; }
        }
    }
    (min as f64, max as f64)
}

fn is_border(x: usize, y: usize, width: usize, height: usize) -> bool {
    x == 0 || y == 0 || x == width - 1 || y == height - 1
}

// Neighbor of (x, y) in direction `d`, if inside the image.
fn neighbor(x: usize, y: usize, d: usize, width: usize, height: usize)
            -> Option<(usize, usize)> {
    let nx = x as i64 + DIR_X[d];
    let ny = y as i64 + DIR_Y[d];
    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
        return None;
    }
    Some((nx as usize, ny as usize))
}

// Pixels with no strictly higher neighbor, sorted ascending by value. Each
// entry holds the quantized value in the upper 32 bits and the pixel offset
// in the lower 32 bits. None if canceled.
fn sorted_seeds(image: &FloatImage,
                (x0, y0, x1, y1): (usize, usize, usize, usize),
                global_min: f64, global_max: f64,
                exclude_edges: bool,
                cancel: &AtomicBool) -> Option<Vec<u64>> {
    let width = image.width();
    let height = image.height();
    let scale = SORT_RANGE / (global_max - global_min);
    let mut seeds = Vec::new();
    for y in y0..y1 {
        if y % 50 == 0 && cancel.load(Ordering::Relaxed) {
            return None;
        }
        for x in x0..x1 {
            let v = image.get(x, y);
            if v as f64 == global_min {
                continue;
            }
            if exclude_edges && is_border(x, y, width, height) {
                continue;
            }
            let is_max = (0..8).all(|d| match neighbor(x, y, d, width, height) {
                Some((nx, ny)) => image.get(nx, ny) <= v,
                None => true,
            });
            if is_max {
                let quantized = ((v as f64 - global_min) * scale) as u64;
                seeds.push(quantized << 32 | (y * width + x) as u64);
            }
        }
    }
    seeds.sort_unstable();
    Some(seeds)
}

struct Region {
    // Representative pixel offset: the equal-height pixel nearest the
    // centroid of the equal-height set.
    pixel: usize,
    // Centroid of the equal-height set, pixel indices.
    x_equal: f64,
    y_equal: f64,
}

struct FloodFill<'a> {
    image: &'a FloatImage,
    width: usize,
    height: usize,
    tolerance: f64,
    exclude_edges: bool,
    max_sorting_error: f64,
    marks: Vec<u8>,
    list: Vec<usize>,
}

impl FloodFill<'_> {
    // Grows the region of pixels within tolerance below `seed`. Returns the
    // region if `seed` is a true maximum. Every pixel visited is marked
    // PROCESSED either way.
    fn analyze(&mut self, seed: usize) -> Option<Region> {
        let mut start = seed;
        loop {
            let (x0, y0) = (start % self.width, start / self.width);
            let mut v0 = self.image.get(x0, y0) as f64;
            self.list.clear();
            self.list.push(start);
            self.marks[start] |= EQUAL | LISTED;

            let mut is_edge_maximum = is_border(x0, y0, self.width, self.height);
            let mut sorting_error = false;
            let mut max_possible = true;
            let mut x_equal = x0 as f64;
            let mut y_equal = y0 as f64;
            let mut n_equal = 1;

            let mut i = 0;
            while i < self.list.len() {
                let offset = self.list[i];
                let (x, y) = (offset % self.width, offset / self.width);
                for d in 0..8 {
                    let Some((x2, y2)) = neighbor(x, y, d, self.width, self.height) else {
                        continue;
                    };
                    let offset2 = y2 * self.width + x2;
                    if self.marks[offset2] & LISTED != 0 {
                        continue;
                    }
                    if self.marks[offset2] & PROCESSED != 0 {
                        // Belongs to a higher maximum handled earlier.
                        max_possible = false;
                        break;
                    }
                    let v2 = self.image.get(x2, y2) as f64;
                    if v2 > v0 + self.max_sorting_error {
                        max_possible = false;
                        break;
                    }
                    if v2 < v0 - self.tolerance {
                        continue;
                    }
                    if v2 > v0 {
                        // Quantized sort put a slightly higher pixel after us;
                        // start over from it.
                        sorting_error = true;
                        start = offset2;
                        v0 = v2;
                    }
                    self.list.push(offset2);
                    self.marks[offset2] |= LISTED;
                    if is_border(x2, y2, self.width, self.height) {
                        is_edge_maximum = true;
                        if self.exclude_edges {
                            max_possible = false;
                            break;
                        }
                    }
                    if v2 == v0 {
                        self.marks[offset2] |= EQUAL;
                        x_equal += x2 as f64;
                        y_equal += y2 as f64;
                        n_equal += 1;
                    }
                }  // for d.
                i += 1;
            }

            if sorting_error {
                for &offset in &self.list {
                    self.marks[offset] = 0;
                }
                continue;
            }

            x_equal /= n_equal as f64;
            y_equal /= n_equal as f64;
            let mut nearest = start;
            let mut min_dist2 = f64::MAX;
            for &offset in &self.list {
                let mark = self.marks[offset];
                self.marks[offset] = PROCESSED;
                if max_possible && mark & EQUAL != 0 {
                    let dx = x_equal - (offset % self.width) as f64;
                    let dy = y_equal - (offset / self.width) as f64;
                    let dist2 = dx * dx + dy * dy;
                    if dist2 < min_dist2 {
                        min_dist2 = dist2;
                        nearest = offset;
                    }
                }
            }
            if !max_possible || (is_edge_maximum && self.exclude_edges) {
                return None;
            }
            return Some(Region{pixel: nearest, x_equal, y_equal});
        }  // loop.
    }
}

// mod tests.
