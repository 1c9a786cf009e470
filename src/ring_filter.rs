//! Annulus median filter.
//!
//! Every pixel is replaced by the median of the pixels lying in a ring
//! `r_inner < r <= r_outer` around it. Sources much smaller than `r_inner`
//! are erased while structure broader than the ring survives, which is what
//! a search for faint extended galaxies wants to detect on. Edges are
//! mirrored the same way as the background mesh filter.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::background::reflect;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingFilterParams {
    /// Filter the stack before background estimation and detection
    pub do_ring_filter: bool,
    /// Inner radius of the ring in pixels (exclusive)
    pub r_inner: f64,
    /// Outer radius of the ring in pixels (inclusive)
    pub r_outer: f64,
}

impl Default for RingFilterParams {
    fn default() -> Self {
        Self {
            do_ring_filter: true,
            r_inner: 5.0,
            r_outer: 8.0,
        }
    }
}

/// Pixel offsets `(dx, dy)` inside the ring.
pub fn footprint(r_inner: f64, r_outer: f64) -> Vec<(i64, i64)> {
    let reach = r_outer.floor() as i64;
    let (inner2, outer2) = (r_inner * r_inner, r_outer * r_outer);
    let mut offsets = Vec::new();
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            let d2 = (dx * dx + dy * dy) as f64;
            if d2 > inner2 && d2 <= outer2 {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

/// Ring-median filtered copy of `data`.
///
/// Non-finite neighbours are skipped. A non-finite pixel stays non-finite
/// so masked regions are still ignored downstream.
pub fn ring_filter(data: &DMatrix<f64>, r_inner: f64, r_outer: f64) -> DMatrix<f64> {
    let (rows, cols) = data.shape();
    let offsets = footprint(r_inner, r_outer);
    let mut window = Vec::with_capacity(offsets.len());
    DMatrix::from_fn(rows, cols, |r, c| {
        let centre = data[(r, c)];
        if !centre.is_finite() || offsets.is_empty() {
            return centre;
        }
        window.clear();
        for &(dx, dy) in &offsets {
            let v = data[(reflect(r as i64 + dy, rows), reflect(c as i64 + dx, cols))];
            if v.is_finite() {
                window.push(v);
            }
        }
        select_median(&mut window).unwrap_or(centre)
    })
}

/// Median by partial selection; the slice is reordered.
fn select_median(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let (lower, upper, _) = values.select_nth_unstable_by(n / 2, |a, b| a.total_cmp(b));
    let upper = *upper;
    if n % 2 == 1 {
        return Some(upper);
    }
    let below = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(0.5 * (below + upper))
}
