use nalgebra::DMatrix;

use super::spline::smooth_coefficients;
use super::{by_area_descending, Findings, ProfileConfig, SelectionConfig, SelectionStrategy};
use crate::models::DetectedObject;

/// Large objects whose brightness along their centre row rises to a single
/// smooth peak. Multi-peaked rows usually belong to star clusters.
#[derive(Debug, Clone)]
pub struct ProfileShape {
    config: SelectionConfig,
}

impl ProfileShape {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Largest `max_tries` corner-filtered objects, largest first.
    pub fn ranked<'a>(&self, objects: &'a [DetectedObject]) -> Vec<&'a DetectedObject> {
        let mut kept = self.config.prefilter(objects);
        by_area_descending(&mut kept);
        kept.truncate(self.config.max_tries);
        kept
    }
}

/// Raw pixel row through the object centre, widened by `extend` and clamped
/// to `clamp` and the image width. `None` when the row is off the image or
/// the span is empty.
pub fn profile_row(obj: &DetectedObject, pixels: &DMatrix<f64>, profile: &ProfileConfig) -> Option<Vec<f64>> {
    let (rows, cols) = pixels.shape();
    if !(obj.y >= 0.0) || obj.y.trunc() as usize >= rows {
        return None;
    }
    let row = obj.y.trunc() as usize;
    let lo = (obj.xmin - profile.extend).max(profile.clamp[0]).max(0);
    let hi = (obj.xmax + profile.extend).min(profile.clamp[1]).min(cols as i64);
    if hi <= lo {
        return None;
    }
    Some((lo as usize..hi as usize).map(|col| pixels[(row, col)]).collect())
}

/// Single-peak test on a smoothed profile: the centre sample is above
/// `mean + std`, the slope at the first quarter is rising and the slope at
/// the third quarter is below the mean.
pub fn is_single_peak(smoothed: &[f64]) -> bool {
    let n = smoothed.len();
    if n < 4 {
        return false;
    }
    let mean = smoothed.iter().sum::<f64>() / n as f64;
    let var = smoothed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let peak = smoothed[n / 2];
    let q1 = n / 4;
    let q3 = 3 * n / 4;
    let rising = smoothed[q1] - smoothed[q1 - 1];
    let falling = smoothed[q3] - smoothed[q3 - 1];
    peak > mean + var.sqrt() && rising > 0.0 && falling < mean
}

/// Whether `obj` passes the profile test on `pixels`.
pub fn has_single_peak(obj: &DetectedObject, pixels: &DMatrix<f64>, profile: &ProfileConfig) -> bool {
    match profile_row(obj, pixels, profile) {
        Some(row) => is_single_peak(&smooth_coefficients(&row, profile.smoothing)),
        None => false,
    }
}

impl SelectionStrategy for ProfileShape {
    fn name(&self) -> &'static str {
        "profile-shape"
    }

    fn select<'a>(&'a self, objects: &'a [DetectedObject], pixels: &'a DMatrix<f64>) -> Findings<'a> {
        let ranked = self.ranked(objects);
        if ranked.is_empty() {
            return Findings::empty();
        }
        tracing::debug!(
            "🔎 Profile shape: {} of {} objects examined",
            ranked.len(),
            objects.len()
        );
        let profile = self.config.profile;
        Findings::new(
            ranked
                .into_iter()
                .filter(move |obj| has_single_peak(obj, pixels, &profile)),
            self.config.max_findings,
        )
    }
}
