//! Corner exclusion for survey stacks.
//!
//! The reduced stacks carry artifacts concentrated in the four corners, which
//! otherwise dominate "largest object" rankings. The filter drops every object
//! whose centre falls inside one of the four `threshold × threshold` squares.

use serde::{Deserialize, Serialize};

use crate::models::DetectedObject;

/// Default stack dimensions in pixels (width, height).
pub const DEFAULT_IMAGE_SIZE: (usize, usize) = (2048, 2048);
/// Default side of each excluded corner square in pixels.
pub const DEFAULT_CORNER_THRESHOLD: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerFilter {
    pub width: usize,
    pub height: usize,
    pub threshold: f64,
}

impl Default for CornerFilter {
    fn default() -> Self {
        Self {
            width: DEFAULT_IMAGE_SIZE.0,
            height: DEFAULT_IMAGE_SIZE.1,
            threshold: DEFAULT_CORNER_THRESHOLD,
        }
    }
}

impl CornerFilter {
    pub fn new(width: usize, height: usize, threshold: f64) -> Self {
        Self {
            width,
            height,
            threshold,
        }
    }

    /// True when (x, y) lies inside one of the corner squares.
    pub fn in_corner(&self, x: f64, y: f64) -> bool {
        let t = self.threshold;
        let left = x < t;
        let right = x > self.width as f64 - t;
        let bottom = y < t;
        let top = y > self.height as f64 - t;
        (left || right) && (bottom || top)
    }

    pub fn keeps(&self, object: &DetectedObject) -> bool {
        !self.in_corner(object.x, object.y)
    }

    /// Lazily drop corner objects, preserving order.
    pub fn filter<'a, I>(&self, objects: I) -> impl Iterator<Item = &'a DetectedObject> + 'a
    where
        I: IntoIterator<Item = &'a DetectedObject>,
        I::IntoIter: 'a,
    {
        let filter = *self;
        objects.into_iter().filter(move |obj| filter.keeps(obj))
    }
}
