// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, not_found_error};
use image::{DynamicImage, GrayImage};
use medians::Medianf64;

// Single channel image with real valued samples, row major.
#[derive(Clone, Debug, PartialEq)]
pub struct FloatImage {
    width: usize,
    height: usize,
    pixels: Vec<f32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PixelStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl FloatImage {
    pub fn new(width: usize, height: usize, pixels: Vec<f32>)
               -> Result<Self, CanonicalError> {
        if pixels.len() != width * height {
            return Err(invalid_argument_error(
                format!("Expected {}x{}={} pixels; got {}",
                        width, height, width * height, pixels.len()).as_str()));
        }
        Ok(FloatImage{width, height, pixels})
    }

    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        FloatImage{width, height, pixels: vec![value; width * height]}
    }

    pub fn from_gray(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        FloatImage{width: width as usize, height: height as usize,
                   pixels: image.as_raw().iter().map(|p| *p as f32).collect()}
    }

    // Color images are reduced to luminance; 16 bit depth is preserved.
    pub fn from_dynamic(image: &DynamicImage) -> Self {
        let luma = image.to_luma16();
        let (width, height) = luma.dimensions();
        FloatImage{width: width as usize, height: height as usize,
                   pixels: luma.as_raw().iter().map(|p| *p as f32).collect()}
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.pixels[y * self.width + x]
    }

    // None outside of the image.
    pub fn get_checked(&self, x: i64, y: i64) -> Option<f32> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(self.pixels[y as usize * self.width + x as usize])
    }

    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.pixels[y * self.width + x] = value;
    }

    pub fn stats(&self) -> PixelStats {
        let mut stats = rolling_stats::Stats::<f64>::new();
        for p in &self.pixels {
            stats.update(*p as f64);
        }
        if self.pixels.is_empty() {
            return PixelStats::default();
        }
        PixelStats{min: stats.min, max: stats.max, mean: stats.mean,
                   std_dev: if stats.std_dev.is_finite() { stats.std_dev } else { 0.0 }}
    }
}

// Offsets of the pixels within `radius` of a pixel center, used as the
// median filter kernel. The +1 on the squared radius rounds out the circle:
// radius 1 is the full 3x3 block, radius 2 a 21 pixel disk.
fn circular_kernel(radius: f64) -> Vec<(i64, i64)> {
    let r2 = radius * radius + 1.0;
    let r = radius.floor() as i64;
    let mut kernel = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            if ((dx * dx + dy * dy) as f64) <= r2 {
                kernel.push((dx, dy));
            }
        }
    }
    kernel
}

/// Circular-kernel median filter; pixels beyond the border take the value of
/// the nearest edge pixel. Returns None if `cancel` is set part way through.
pub fn median_filter(image: &FloatImage, radius: f64, cancel: &AtomicBool)
                     -> Option<FloatImage> {
    let kernel = circular_kernel(radius);
    let (w, h) = (image.width as i64, image.height as i64);
    let mut out = FloatImage::filled(image.width, image.height, 0.0);
    let mut window = vec![0.0_f64; kernel.len()];
    for y in 0..h {
        if y % 50 == 0 && cancel.load(Ordering::Relaxed) {
            return None;
        }
        for x in 0..w {
            for (slot, (dx, dy)) in window.iter_mut().zip(kernel.iter()) {
                let sx = (x + dx).clamp(0, w - 1) as usize;
                let sy = (y + dy).clamp(0, h - 1) as usize;
                *slot = image.get(sx, sy) as f64;
            }
            out.set(x as usize, y as usize, window.as_slice().medf_unchecked() as f32);
        }
    }
    Some(out)
}

/// Read-only access to the slices of an image or image stack. All slices
/// share one width and height.
pub trait ImageStack {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn slice_count(&self) -> usize;

    // `index` is zero based.
    fn slice(&self, index: usize) -> Result<FloatImage, CanonicalError>;

    // Human readable name for progress and log messages.
    fn slice_label(&self, index: usize) -> String {
        format!("slice {}", index + 1)
    }
}

pub struct MemoryStack {
    slices: Vec<FloatImage>,
}

impl MemoryStack {
    pub fn new(slices: Vec<FloatImage>) -> Result<Self, CanonicalError> {
        let Some(first) = slices.first() else {
            return Err(invalid_argument_error("Image stack has no slices"));
        };
        let (w, h) = (first.width(), first.height());
        if let Some(bad) = slices.iter().position(|s| s.width() != w || s.height() != h) {
            return Err(invalid_argument_error(
                format!("Slice {} is {}x{}; expected {}x{}",
                        bad + 1, slices[bad].width(), slices[bad].height(),
                        w, h).as_str()));
        }
        Ok(MemoryStack{slices})
    }
}

impl ImageStack for MemoryStack {
    fn width(&self) -> usize {
        self.slices[0].width()
    }
    fn height(&self) -> usize {
        self.slices[0].height()
    }
    fn slice_count(&self) -> usize {
        self.slices.len()
    }
    fn slice(&self, index: usize) -> Result<FloatImage, CanonicalError> {
        self.slices.get(index).cloned().ok_or_else(|| not_found_error(
            format!("No slice {} in {} slice stack",
                    index + 1, self.slices.len()).as_str()))
    }
}

/// Stack backed by one image file per slice. Slices are decoded on demand.
pub struct FileStack {
    paths: Vec<PathBuf>,
    width: usize,
    height: usize,
}

impl FileStack {
    pub fn open(paths: Vec<PathBuf>) -> Result<Self, CanonicalError> {
        let Some(first) = paths.first() else {
            return Err(invalid_argument_error("No image files given"));
        };
        let (width, height) = image_dimensions(first)?;
        Ok(FileStack{paths, width, height})
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

fn image_dimensions(path: &Path) -> Result<(usize, usize), CanonicalError> {
    match image::image_dimensions(path) {
        Ok((w, h)) => Ok((w as usize, h as usize)),
        Err(e) => Err(failed_precondition_error(
            format!("Error reading {:?}: {:?}", path, e).as_str())),
    }
}

impl ImageStack for FileStack {
    fn width(&self) -> usize {
        self.width
    }
    fn height(&self) -> usize {
        self.height
    }
    fn slice_count(&self) -> usize {
        self.paths.len()
    }
    fn slice(&self, index: usize) -> Result<FloatImage, CanonicalError> {
        let path = self.paths.get(index).ok_or_else(|| not_found_error(
            format!("No slice {} in {} slice stack",
                    index + 1, self.paths.len()).as_str()))?;
        let decoded = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                return Err(failed_precondition_error(
                    format!("Error decoding {:?}: {:?}", path, e).as_str()));
            }
        };
        let slice = FloatImage::from_dynamic(&decoded);
        if slice.width() != self.width || slice.height() != self.height {
            return Err(failed_precondition_error(
                format!("{:?} is {}x{}; stack is {}x{}", path, slice.width(),
                        slice.height(), self.width, self.height).as_str()));
        }
        Ok(slice)
    }
    fn slice_label(&self, index: usize) -> String {
        match self.paths.get(index).and_then(|p| p.file_name()) {
            Some(name) => name.to_string_lossy().to_string(),
            None => format!("slice {}", index + 1),
        }
    }
}

// mod tests.
