use nalgebra::DMatrix;

use super::{by_area_descending, Findings, SelectionConfig, SelectionStrategy};
use crate::models::DetectedObject;

/// Large objects that are fainter per pixel than the catalog average.
///
/// The catalog is ranked by `cflux / npix`; the percentile window drops the
/// most compact sources (stars) and the faintest noise. The largest
/// `max_tries` of what remains are accepted when their surface brightness is
/// below the mean of the corner-filtered catalog.
#[derive(Debug, Clone)]
pub struct SurfaceBrightness {
    config: SelectionConfig,
}

impl SurfaceBrightness {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Objects that will be examined, in examination order, plus the mean
    /// surface brightness they are compared against.
    pub fn ranked<'a>(&self, objects: &'a [DetectedObject]) -> (Vec<&'a DetectedObject>, f64) {
        let mut kept = self.config.prefilter(objects);
        if kept.is_empty() {
            return (kept, f64::NAN);
        }
        let mean = kept.iter().map(|o| o.surface_brightness()).sum::<f64>() / kept.len() as f64;

        kept.sort_by(|a, b| a.surface_brightness().total_cmp(&b.surface_brightness()));
        let count = kept.len();
        let [lo, hi] = self.config.percentiles;
        let start = (count * lo / 100).min(count);
        let end = (count * hi / 100).clamp(start, count);

        let mut window: Vec<_> = kept[start..end].to_vec();
        by_area_descending(&mut window);
        window.truncate(self.config.max_tries);
        (window, mean)
    }
}

impl SelectionStrategy for SurfaceBrightness {
    fn name(&self) -> &'static str {
        "surface-brightness"
    }

    fn select<'a>(&'a self, objects: &'a [DetectedObject], _pixels: &'a DMatrix<f64>) -> Findings<'a> {
        let (ranked, mean) = self.ranked(objects);
        if ranked.is_empty() {
            return Findings::empty();
        }
        tracing::debug!(
            "🔎 Surface brightness: {} of {} objects examined against mean {:.4}",
            ranked.len(),
            objects.len(),
            mean
        );
        Findings::new(
            ranked.into_iter().filter(move |obj| obj.surface_brightness() < mean),
            self.config.max_findings,
        )
    }
}
