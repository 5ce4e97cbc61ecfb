// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error, not_found_error};
use log::info;

use crate::fits_header::Header;

// Where solved headers go.
pub trait HeaderStore {
    // None if the slice has no header yet.
    fn get_header(&self, slice: usize) -> Result<Option<Header>, CanonicalError>;

    fn put_header(&mut self, slice: usize, header: Header) -> Result<(), CanonicalError>;

    // Makes the slice's current header durable.
    fn persist(&mut self, slice: usize) -> Result<(), CanonicalError>;
}

fn out_of_range(slice: usize, count: usize) -> CanonicalError {
    not_found_error(format!("No slice {} in {} slice stack", slice + 1, count).as_str())
}

/// Headers kept in memory only; persist() records which slices were saved.
#[derive(Debug, Default)]
pub struct MemoryHeaderStore {
    headers: Vec<Option<Header>>,
    persisted: Vec<usize>,
}

impl MemoryHeaderStore {
    pub fn new(slice_count: usize) -> Self {
        MemoryHeaderStore{headers: vec![None; slice_count], persisted: Vec::new()}
    }

    pub fn with_headers(headers: Vec<Option<Header>>) -> Self {
        MemoryHeaderStore{headers, persisted: Vec::new()}
    }

    pub fn header(&self, slice: usize) -> Option<&Header> {
        self.headers.get(slice).and_then(|h| h.as_ref())
    }

    pub fn persisted(&self) -> &[usize] {
        &self.persisted
    }
}

impl HeaderStore for MemoryHeaderStore {
    fn get_header(&self, slice: usize) -> Result<Option<Header>, CanonicalError> {
        match self.headers.get(slice) {
            Some(h) => Ok(h.clone()),
            None => Err(out_of_range(slice, self.headers.len())),
        }
    }

    fn put_header(&mut self, slice: usize, header: Header) -> Result<(), CanonicalError> {
        let count = self.headers.len();
        match self.headers.get_mut(slice) {
            Some(h) => {
                *h = Some(header);
                Ok(())
            },
            None => Err(out_of_range(slice, count)),
        }
    }

    fn persist(&mut self, slice: usize) -> Result<(), CanonicalError> {
        if slice >= self.headers.len() {
            return Err(out_of_range(slice, self.headers.len()));
        }
        self.persisted.push(slice);
        Ok(())
    }
}

/// Headers stored as text files of 80 column cards alongside each slice's
/// image file: `m42.png` has header `m42.hdr`. Existing sidecars are loaded
/// up front. persist() writes into a `wcs` directory next to the image so
/// the originals are left alone.
pub struct SidecarHeaderStore {
    image_paths: Vec<PathBuf>,
    headers: Vec<Option<Header>>,
}

impl SidecarHeaderStore {
    pub fn open(image_paths: &[PathBuf]) -> Result<Self, CanonicalError> {
        let mut headers = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            let sidecar = path.with_extension("hdr");
            if !sidecar.exists() {
                headers.push(None);
                continue;
            }
            let text = fs::read_to_string(&sidecar).map_err(|e| failed_precondition_error(
                format!("Error reading {:?}: {:?}", sidecar, e).as_str()))?;
            headers.push(Some(Header::parse_lines(&text)?));
        }
        Ok(SidecarHeaderStore{image_paths: image_paths.to_vec(), headers})
    }

    // Destination of persist() for the slice whose image is `image_path`.
    pub fn output_path(image_path: &Path) -> PathBuf {
        let dir = image_path.parent().unwrap_or(Path::new("")).join("wcs");
        let name = image_path.with_extension("hdr");
        match name.file_name() {
            Some(file_name) => dir.join(file_name),
            None => dir.join("header.hdr"),
        }
    }
}

impl HeaderStore for SidecarHeaderStore {
    fn get_header(&self, slice: usize) -> Result<Option<Header>, CanonicalError> {
        match self.headers.get(slice) {
            Some(h) => Ok(h.clone()),
            None => Err(out_of_range(slice, self.headers.len())),
        }
    }

    fn put_header(&mut self, slice: usize, header: Header) -> Result<(), CanonicalError> {
        let count = self.headers.len();
        match self.headers.get_mut(slice) {
            Some(h) => {
                *h = Some(header);
                Ok(())
            },
            None => Err(out_of_range(slice, count)),
        }
    }

    fn persist(&mut self, slice: usize) -> Result<(), CanonicalError> {
        let count = self.headers.len();
        let (Some(image_path), Some(header)) =
            (self.image_paths.get(slice), self.headers.get(slice)) else {
            return Err(out_of_range(slice, count));
        };
        let Some(header) = header else {
            return Err(failed_precondition_error(
                format!("Slice {} has no header to save", slice + 1).as_str()));
        };
        let out_path = Self::output_path(image_path);
        if let Some(dir) = out_path.parent() {
            if dir.exists() && !dir.is_dir() {
                return Err(failed_precondition_error(
                    format!("{:?} exists and is not a directory", dir).as_str()));
            }
            fs::create_dir_all(dir).map_err(|e| failed_precondition_error(
                format!("Could not create {:?}: {:?}", dir, e).as_str()))?;
        }
        fs::write(&out_path, header.to_lines()).map_err(|e| failed_precondition_error(
            format!("Error writing {:?}: {:?}", out_path, e).as_str()))?;
        info!("Saved header to {:?}", out_path);
        Ok(())
    }
}

// mod tests.
