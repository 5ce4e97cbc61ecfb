// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use serde_json::{json, Map, Value};

use crate::solve_config::SolveConfig;
use crate::solver_trait::{ImagePos, Session};

// File name the service sees for the uploaded source list.
pub const SOURCE_TABLE_NAME: &str = "maxima.tbl";

/// Everything sent in one upload: the `request-json` form field and the
/// source table file.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadPayload {
    pub request_json: String,
    pub source_table: String,
    pub num_sources: usize,
}

/// One "x \t y" line per source, CRLF terminated, plus a blank line at the
/// end. Y is flipped so the origin is the bottom row, as FITS expects.
pub fn encode_source_table(sources: &[ImagePos], image_height: usize) -> String {
    let mut table = String::with_capacity(sources.len() * 24 + 2);
    for pos in sources {
        table.push_str(format!("{} \t {}\r\n", pos.x, image_height as f64 - pos.y).as_str());
    }
    table.push_str("\r\n");
    table
}

/// Upload options. Fields the config leaves unset are omitted.
pub fn request_json(config: &SolveConfig, session: &Session,
                    width: usize, height: usize) -> Value {
    let mut request = Map::new();
    request.insert("allow_commercial_use".to_string(), json!("d"));
    request.insert("allow_modifications".to_string(), json!("d"));
    request.insert("publicly_visible".to_string(), json!("n"));
    request.insert("image_width".to_string(), json!(width));
    request.insert("image_height".to_string(), json!(height));
    if let Some(scale) = &config.scale {
        request.insert("scale_units".to_string(), json!("arcsecperpix"));
        request.insert("scale_type".to_string(), json!("ul"));
        request.insert("scale_lower".to_string(), json!(scale.estimate - scale.tolerance));
        request.insert("scale_upper".to_string(), json!(scale.estimate + scale.tolerance));
    }
    if let Some(sky) = &config.sky_position {
        request.insert("center_ra".to_string(), json!(sky.ra));
        request.insert("center_dec".to_string(), json!(sky.dec));
        request.insert("radius".to_string(), json!(sky.radius));
    }
    request.insert("downsample_factor".to_string(), json!(1));
    request.insert("crpix_center".to_string(), json!(true));
    request.insert("tweak_order".to_string(), json!(config.tweak_order()));
    request.insert("session".to_string(), json!(session.0));
    Value::Object(request)
}

pub fn build_payload(sources: &[ImagePos], config: &SolveConfig, session: &Session,
                     width: usize, height: usize) -> UploadPayload {
    UploadPayload{
        request_json: request_json(config, session, width, height).to_string(),
        source_table: encode_source_table(sources, height),
        num_sources: sources.len(),
    }
}

// mod tests.
