// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Rules for folding a returned WCS solution and its annotations into an
//! existing image header.

use chrono::{DateTime, Local};

use crate::fits_header::{Header, HeaderCard};
use crate::solver_trait::Annotation;

/// Keywords describing a celestial WCS. Any of these already present in a
/// header are dropped before a new solution is written, so a previous
/// solution never leaks into the new one.
pub const WCS_KEYWORDS: [&str; 23] = [
    "WCSAXES", "CTYPE1", "CTYPE2", "CUNIT1", "CUNIT2", "EQUINOX", "EPOCH",
    "LONPOLE", "LATPOLE", "CRVAL1", "CRVAL2", "CRPIX1", "CRPIX2",
    "CD1_1", "CD1_2", "CD2_1", "CD2_2", "IMAGEW", "IMAGEH",
    "A_ORDER", "B_ORDER", "AP_ORDER", "BP_ORDER",
];

// SIP polynomial coefficient prefixes; coefficients are <prefix>_<i>_<j> with
// i, j in 0..=9.
const SIP_PREFIXES: [&str; 4] = ["A", "B", "AP", "BP"];

// Seventh field of an ANNOTATE value marking annotations we wrote.
const SOLVER_ANNOTATION_TAG: &str = "1";

pub fn is_wcs_keyword(key: &str) -> bool {
    if WCS_KEYWORDS.contains(&key) {
        return true;
    }
    let mut parts = key.split('_');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(i), Some(j), None) =>
            SIP_PREFIXES.contains(&prefix) && is_sip_index(i) && is_sip_index(j),
        _ => false,
    }
}

fn is_sip_index(s: &str) -> bool {
    s.len() == 1 && s.as_bytes()[0].is_ascii_digit()
}

/// True if `header` carries a complete celestial solution: RA/Dec axis
/// types, reference point, reference pixel, and a CD matrix or CDELT scale.
pub fn has_valid_wcs(header: &Header) -> bool {
    let ctype1 = header.get_string("CTYPE1").unwrap_or_default();
    let ctype2 = header.get_string("CTYPE2").unwrap_or_default();
    if !ctype1.starts_with("RA--") || !ctype2.starts_with("DEC-") {
        return false;
    }
    let numeric = |key: &str| header.get_f64(key).is_some();
    if !(numeric("CRVAL1") && numeric("CRVAL2") &&
         numeric("CRPIX1") && numeric("CRPIX2")) {
        return false;
    }
    let has_cd = numeric("CD1_1") && numeric("CD1_2") &&
        numeric("CD2_1") && numeric("CD2_2");
    let has_cdelt = numeric("CDELT1") && numeric("CDELT2");
    has_cd || has_cdelt
}

/// Removes every WCS keyword from `header`, then appends the WCS cards of
/// `solution` in the order the service returned them. Returns the number of
/// cards added.
pub fn merge_wcs(header: &mut Header, solution: &Header) -> usize {
    header.remove_where(|c| is_wcs_keyword(&c.key));
    let mut added = 0;
    for card in solution.cards() {
        if is_wcs_keyword(&card.key) && card.value.is_some() {
            header.push(card.clone());
            added += 1;
        }
    }
    added
}

pub fn add_solve_history(header: &mut Header, base_url: &str, now: DateTime<Local>) {
    header.add_history(format!("WCS solution obtained from {}", base_url).as_str());
    header.add_history(
        format!("WCS solution written {}", now.format("%Y-%m-%dT%H:%M:%S%.3f")).as_str());
}

#[derive(Clone, Debug)]
pub struct AnnotationStyle {
    // Circle radius, pixels.
    pub radius: f64,
    pub color: String,
}

/// ANNOTATE card for one annotation:
/// `'x,y,radius,show circle,centered,show label,solver tag,color' / label`.
pub fn annotation_card(annotation: &Annotation, style: &AnnotationStyle) -> HeaderCard {
    let value = format!("{},{},{},1,0,1,{},{}",
                        short_decimal(annotation.pixel_x),
                        short_decimal(annotation.pixel_y),
                        short_decimal(style.radius),
                        SOLVER_ANNOTATION_TAG,
                        style.color);
    HeaderCard::string("ANNOTATE", &value,
                       Some(ascii_label(&annotation.name).as_str()))
}

/// Removes ANNOTATE cards written by a previous solve, leaving any other
/// annotations alone. Returns the number removed.
pub fn remove_solver_annotations(header: &mut Header) -> usize {
    header.remove_where(|c| {
        c.key == "ANNOTATE" &&
            c.string_value()
             .map(|v| v.split(',').nth(6) == Some(SOLVER_ANNOTATION_TAG))
             .unwrap_or(false)
    })
}

// At most two decimals, no trailing zeros.
fn short_decimal(value: f64) -> String {
    let s = format!("{:.2}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}

const GREEK_NAMES: [(char, &str); 24] = [
    ('α', "alpha"), ('β', "beta"), ('γ', "gamma"), ('δ', "delta"),
    ('ε', "epsilon"), ('ζ', "zeta"), ('η', "eta"), ('θ', "theta"),
    ('ι', "iota"), ('κ', "kappa"), ('λ', "lambda"), ('μ', "mu"),
    ('ν', "nu"), ('ξ', "xi"), ('ο', "omicron"), ('π', "pi"),
    ('ρ', "rho"), ('σ', "sigma"), ('τ', "tau"), ('υ', "upsilon"),
    ('φ', "phi"), ('χ', "chi"), ('ψ', "psi"), ('ω', "omega"),
];

/// Header text must be ASCII. Greek letters (common in star names) are
/// spelled out, upper case letters as upper case names; other characters
/// become '?'.
pub fn ascii_label(name: &str) -> String {
    let mut label = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii() && !ch.is_ascii_control() {
            label.push(ch);
            continue;
        }
        if ch == 'ς' {  // Final sigma.
            label.push_str("sigma");
            continue;
        }
        let lower = ch.to_lowercase().next().unwrap_or(ch);
        match GREEK_NAMES.iter().find(|(g, _)| *g == lower) {
            Some((_, spelled)) if lower != ch => label.push_str(&spelled.to_uppercase()),
            Some((_, spelled)) => label.push_str(spelled),
            None => label.push('?'),
        }
    }
    label
}

// mod tests.
