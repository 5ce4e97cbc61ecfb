// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use crate::image_utils::FloatImage;
use crate::solver_trait::ImagePos;

#[derive(Clone, Debug, PartialEq)]
pub struct Aperture {
    // Source radius, pixels.
    pub radius: f64,

    // Background annulus. No background is subtracted if `back_outer` is
    // not larger than `back_inner`.
    pub back_inner: f64,
    pub back_outer: f64,

    // Fit a plane to the annulus instead of using its mean.
    pub back_plane: bool,

    // Iteratively reject annulus pixels further than 2 sigma from the mean.
    pub remove_back_stars: bool,
}

impl Default for Aperture {
    fn default() -> Self {
        Aperture{radius: 20.0, back_inner: 30.0, back_outer: 40.0,
                 back_plane: false, remove_back_stars: true}
    }
}

const MAX_ITERATIONS: usize = 100;
const CONVERGED_SHIFT: f64 = 0.01;

// Sky level around a source: constant, or a plane in coordinates relative to
// the aperture center.
#[derive(Clone, Copy, Debug)]
enum Background {
    Flat(f64),
    Plane{a: f64, b: f64, c: f64},
}

impl Background {
    fn at(&self, di: f64, dj: f64) -> f64 {
        match *self {
            Background::Flat(v) => v,
            Background::Plane{a, b, c} => a + b * di + c * dj,
        }
    }
}

/// Refines `start` to the intensity centroid of the source around it, using
/// marginal sums over the aperture box with the local sky removed. Returns
/// None when there is no signal above the background or the centroid runs
/// off more than an aperture box away from `start`.
pub fn measure_centroid(image: &FloatImage, start: ImagePos, aperture: &Aperture)
                        -> Option<ImagePos> {
    let box_size = (2.0 * aperture.radius) as i64;
    if box_size < 1 {
        return None;
    }
    let mut xc = start.x;
    let mut yc = start.y;
    let mut i1 = (xc - aperture.radius) as i64;
    let mut j1 = (yc - aperture.radius) as i64;
    let mut sky = sky_background(image, xc, yc, aperture);

    for _ in 0..MAX_ITERATIONS {
        let (i2, j2) = (i1 + box_size, j1 + box_size);
        let ncols = (i2 - i1 + 1) as f64;
        let nrows = (j2 - j1 + 1) as f64;

        let mut col_sums = vec![0.0; (i2 - i1 + 1) as usize];
        let mut row_sums = vec![0.0; (j2 - j1 + 1) as usize];
        let mut total = 0.0;
        for j in j1..=j2 {
            let dj = j as f64 - yc + 0.5;
            for i in i1..=i2 {
                let Some(val) = image.get_checked(i, j) else {
                    continue;
                };
                let di = i as f64 - xc + 0.5;
                let signal = val as f64 - sky.at(di, dj);
                col_sums[(i - i1) as usize] += signal;
                row_sums[(j - j1) as usize] += signal;
                total += signal;
            }
        }
        let (dx, x_weight) = marginal_offset(&col_sums, total / ncols, i1, xc);
        let (dy, y_weight) = marginal_offset(&row_sums, total / nrows, j1, yc);
        if x_weight == 0.0 || y_weight == 0.0 {
            return None;  // No signal.
        }
        if (xc + dx - start.x).abs() > box_size as f64 ||
            (yc + dy - start.y).abs() > box_size as f64 {
            return None;
        }
        xc += dx;
        yc += dy;
        if dx.abs() < CONVERGED_SHIFT && dy.abs() < CONVERGED_SHIFT {
            break;
        }
        i1 = xc as i64 - box_size / 2;
        j1 = yc as i64 - box_size / 2;
        sky = sky_background(image, xc, yc, aperture);
    }
    Some(ImagePos{x: xc, y: yc})
}

// Weighted offset of the marginal distribution from `center`, counting only
// bins above the mean bin. Returns (offset, total weight).
fn marginal_offset(sums: &[f64], mean: f64, first: i64, center: f64) -> (f64, f64) {
    let mut weight = 0.0;
    let mut moment = 0.0;
    for (k, sum) in sums.iter().enumerate() {
        let excess = sum - mean;
        if excess > 0.0 {
            let d = (first + k as i64) as f64 - center + 0.5;
            weight += excess;
            moment += excess * d;
        }
    }
    if weight == 0.0 {
        return (0.0, 0.0);
    }
    (moment / weight, weight)
}

fn sky_background(image: &FloatImage, xc: f64, yc: f64, aperture: &Aperture)
                  -> Background {
    if aperture.back_outer <= aperture.back_inner {
        return Background::Flat(0.0);
    }
    let r1_sq = aperture.back_inner * aperture.back_inner;
    let r2_sq = aperture.back_outer * aperture.back_outer;
    let i1 = (xc - aperture.back_outer) as i64;
    let i2 = (xc + aperture.back_outer) as i64;
    let j1 = (yc - aperture.back_outer) as i64;
    let j2 = (yc + aperture.back_outer) as i64;

    // (di, dj, value) for annulus pixels.
    let mut samples = Vec::new();
    for j in j1..=j2 {
        let dj = j as f64 - yc + 0.5;
        for i in i1..=i2 {
            let di = i as f64 - xc + 0.5;
            let r_sq = di * di + dj * dj;
            if r_sq < r1_sq || r_sq > r2_sq {
                continue;
            }
            if let Some(val) = image.get_checked(i, j) {
                samples.push((di, dj, val as f64));
            }
        }
    }
    if samples.is_empty() {
        return Background::Flat(0.0);
    }

    let (mut lo, mut hi) = (f64::NEG_INFINITY, f64::INFINITY);
    if aperture.remove_back_stars {
        let values: Vec<f64> = samples.iter().map(|s| s.2).collect();
        let mut prev_mean = 0.0;
        for iteration in 0..9 {
            let kept: Vec<f64> = values.iter().copied()
                .filter(|v| iteration == 0 || (*v >= lo && *v <= hi)).collect();
            if kept.is_empty() {
                break;
            }
            let mean = statistical::mean(&kept);
            let std_dev = statistical::population_standard_deviation(&kept, Some(mean));
            lo = mean - 2.0 * std_dev;
            hi = mean + 2.0 * std_dev;
            if (prev_mean - mean).abs() < 0.1 {
                break;
            }
            prev_mean = mean;
        }
    }
    let kept: Vec<(f64, f64, f64)> =
        samples.into_iter().filter(|s| s.2 >= lo && s.2 <= hi).collect();
    if kept.is_empty() {
        return Background::Flat(0.0);
    }
    let mean = kept.iter().map(|s| s.2).sum::<f64>() / kept.len() as f64;
    if aperture.back_plane {
        if let Some(plane) = fit_plane(&kept) {
            return plane;
        }
    }
    Background::Flat(mean)
}

// Least squares fit of v = a + b*di + c*dj. None if degenerate.
fn fit_plane(samples: &[(f64, f64, f64)]) -> Option<Background> {
    let n = samples.len() as f64;
    let (mut sx, mut sy, mut sv) = (0.0, 0.0, 0.0);
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    let (mut sxv, mut syv) = (0.0, 0.0);
    for &(x, y, v) in samples {
        sx += x; sy += y; sv += v;
        sxx += x * x; syy += y * y; sxy += x * y;
        sxv += x * v; syv += y * v;
    }
    // Normal equations, solved by Cramer's rule.
    let m = [[n, sx, sy], [sx, sxx, sxy], [sy, sxy, syy]];
    let rhs = [sv, sxv, syv];
    let det = det3(&m);
    if det.abs() < 1e-12 {
        return None;
    }
    let mut coef = [0.0; 3];
    for (k, c) in coef.iter_mut().enumerate() {
        let mut mk = m;
        for row in 0..3 {
            mk[row][k] = rhs[row];
        }
        *c = det3(&mk) / det;
    }
    Some(Background::Plane{a: coef[0], b: coef[1], c: coef[2]})
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

// mod tests.
