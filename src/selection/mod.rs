//! Candidate selection over an extracted catalog.
//!
//! A strategy ranks the catalog, examines at most `max_tries` objects and
//! lazily yields the accepted ones through [`Findings`].

pub mod profile_shape;
pub mod spline;
pub mod surface_brightness;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::corners::{CornerFilter, DEFAULT_IMAGE_SIZE};
use crate::error::ConfigurationError;
use crate::models::DetectedObject;

pub use profile_shape::ProfileShape;
pub use surface_brightness::SurfaceBrightness;

/// Corner square side both strategies exclude by default.
pub const STRATEGY_CORNER_THRESHOLD: f64 = 500.0;

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Yield accepted objects, bounded by the configured caps.
    fn select<'a>(&'a self, objects: &'a [DetectedObject], pixels: &'a DMatrix<f64>) -> Findings<'a>;
}

/// Lazily accepted candidates. Stops after `max_findings + 1` items, which is
/// the historical stop rule of the survey pipeline.
pub struct Findings<'a> {
    inner: Box<dyn Iterator<Item = &'a DetectedObject> + 'a>,
    remaining: usize,
}

impl<'a> Findings<'a> {
    pub fn new<I>(inner: I, max_findings: usize) -> Self
    where
        I: Iterator<Item = &'a DetectedObject> + 'a,
    {
        Self {
            inner: Box::new(inner),
            remaining: max_findings.saturating_add(1),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Box::new(std::iter::empty()),
            remaining: 0,
        }
    }

    /// Drain eagerly into owned records.
    pub fn collect_bounded(self) -> Vec<DetectedObject> {
        self.cloned().collect()
    }
}

impl<'a> Iterator for Findings<'a> {
    type Item = &'a DetectedObject;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let next = self.inner.next()?;
        self.remaining -= 1;
        Some(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Large objects fainter per pixel than the catalog average
    SurfaceBrightness,
    /// Large objects with a single smooth central peak along their row
    ProfileShape,
}

impl StrategyKind {
    pub fn build(self, config: SelectionConfig) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::SurfaceBrightness => Box::new(SurfaceBrightness::new(config)),
            StrategyKind::ProfileShape => Box::new(ProfileShape::new(config)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::SurfaceBrightness => "surface-brightness",
            StrategyKind::ProfileShape => "profile-shape",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-profile window and smoothing used by the profile-shape test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Column range the profile may cover, `[lo, hi)`
    pub clamp: [i64; 2],
    /// Columns added on either side of the bounding box
    pub extend: i64,
    /// Smoothing-spline lambda
    pub smoothing: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            clamp: [30, 2030],
            extend: 30,
            smoothing: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub max_tries: usize,
    pub max_findings: usize,
    /// Surface-brightness percentile window `[lo, hi]`
    pub percentiles: [usize; 2],
    pub skip_corner_filter: bool,
    pub corner_threshold: f64,
    /// Image `(width, height)` the corner squares are placed in
    pub image_size: (usize, usize),
    pub profile: ProfileConfig,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_tries: 10,
            max_findings: 2,
            percentiles: [10, 99],
            skip_corner_filter: false,
            corner_threshold: STRATEGY_CORNER_THRESHOLD,
            image_size: DEFAULT_IMAGE_SIZE,
            profile: ProfileConfig::default(),
        }
    }
}

impl SelectionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_tries < 1 {
            return Err(ConfigurationError::TooSmall {
                field: "max_tries",
                min: 1,
                value: self.max_tries,
            });
        }
        let [lo, hi] = self.percentiles;
        if lo >= hi || hi > 100 {
            return Err(ConfigurationError::Percentiles(lo, hi));
        }
        if !(self.corner_threshold >= 0.0) {
            return Err(ConfigurationError::NotPositive {
                field: "corner_threshold",
                value: self.corner_threshold,
            });
        }
        if !(self.profile.smoothing > 0.0) || !self.profile.smoothing.is_finite() {
            return Err(ConfigurationError::NotPositive {
                field: "profile.smoothing",
                value: self.profile.smoothing,
            });
        }
        Ok(())
    }

    pub fn corner_filter(&self) -> CornerFilter {
        CornerFilter::new(self.image_size.0, self.image_size.1, self.corner_threshold)
    }

    /// Objects left after the corner cut, in catalog order.
    pub(crate) fn prefilter<'a>(&self, objects: &'a [DetectedObject]) -> Vec<&'a DetectedObject> {
        if self.skip_corner_filter {
            objects.iter().collect()
        } else {
            self.corner_filter().filter(objects).collect()
        }
    }
}

/// Largest footprints first. Stable, so ties keep their incoming order.
pub(crate) fn by_area_descending(objects: &mut [&DetectedObject]) {
    objects.sort_by(|a, b| b.npix.cmp(&a.npix));
}
