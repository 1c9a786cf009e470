//! Directory-backed image repository for survey stacks.
//!
//! Stacks are named `F<hhmm><±dd>_<anything>.fits` after the field centre.
//! Several stacks may cover the same field; the one with the highest
//! `SB_SIG` header value wins.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::ImageResolutionError;
use crate::image::{self, SurveyImage, SB_SIG_CARD};
use crate::models::SkyCoord;

static FIELD_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^F(\d{2})(\d{2})([+-]\d{2})").expect("valid field-name regex")
});

/// Read-only access to survey images by sky position. Shared by all
/// workers of a scan.
pub trait ImageRepository: Send + Sync {
    fn resolve(&self, coord: &SkyCoord) -> Result<SurveyImage, ImageResolutionError>;

    /// Every distinct field centre, in repository order.
    fn unique_coords(&self) -> Vec<SkyCoord>;
}

#[derive(Debug, Clone)]
struct Stack {
    name: String,
    field: SkyCoord,
}

/// Field centre encoded in a stack file name. RA hour values above 24 wrap.
pub fn parse_field_name(name: &str) -> Option<SkyCoord> {
    if !name.ends_with("fits") {
        return None;
    }
    let caps = FIELD_NAME.captures(name)?;
    let mut hhmm: u32 = format!("{}{}", &caps[1], &caps[2]).parse().ok()?;
    if hhmm > 2400 {
        hhmm -= 2400;
    }
    let hours = f64::from(hhmm / 100) + f64::from(hhmm % 100) / 60.0;
    let dec: i32 = caps[3].parse().ok()?;
    Some(SkyCoord::new(hours * 15.0, f64::from(dec)))
}

#[derive(Debug, Clone)]
pub struct Butler {
    root: PathBuf,
    stacks: Vec<Stack>,
}

impl Butler {
    /// Index every stack in `root`. Files that do not follow the naming
    /// scheme are ignored.
    pub fn open(root: &Path) -> Result<Self, ImageResolutionError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut stacks = Vec::with_capacity(names.len());
        for name in names {
            match parse_field_name(&name) {
                Some(field) => stacks.push(Stack { name, field }),
                None => tracing::debug!("Skipping {}: not a survey stack", name),
            }
        }
        if stacks.is_empty() {
            return Err(ImageResolutionError::EmptyRepository(root.to_path_buf()));
        }

        tracing::info!(
            "🗂️  Indexed {} stacks in {}",
            stacks.len(),
            root.display()
        );
        Ok(Self {
            root: root.to_path_buf(),
            stacks,
        })
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    fn nearest_field(&self, coord: &SkyCoord) -> Option<SkyCoord> {
        self.stacks
            .iter()
            .map(|s| s.field)
            .min_by(|a, b| coord.separation(a).total_cmp(&coord.separation(b)))
    }

    /// Path of the stack `resolve` would load for `coord`.
    pub fn image_path(&self, coord: &SkyCoord) -> Result<PathBuf, ImageResolutionError> {
        let field = self
            .nearest_field(coord)
            .ok_or(ImageResolutionError::NoMatch { coord: *coord })?;
        let matches: Vec<&Stack> = self
            .stacks
            .iter()
            .filter(|s| s.field.bits() == field.bits())
            .collect();

        let chosen = match matches.as_slice() {
            [] => return Err(ImageResolutionError::NoMatch { coord: *coord }),
            [only] => *only,
            [first, ..] => {
                let mut best: (&Stack, f64) = (*first, f64::NAN);
                for stack in &matches {
                    let sig = self.sb_sig(stack).unwrap_or(f64::NAN);
                    // NaN never wins; the first stack stands if none has a value
                    if sig > best.1 || (best.1.is_nan() && !sig.is_nan()) {
                        best = (*stack, sig);
                    }
                }
                tracing::debug!(
                    "Picked {} of {} stacks for field {} (SB_SIG {})",
                    best.0.name,
                    matches.len(),
                    field,
                    best.1
                );
                best.0
            }
        };
        Ok(self.root.join(&chosen.name))
    }

    fn sb_sig(&self, stack: &Stack) -> Option<f64> {
        let path = self.root.join(&stack.name);
        match image::read_card(&path, SB_SIG_CARD) {
            Ok(value) => value.filter(|v| !v.is_nan()),
            Err(e) => {
                tracing::warn!("⚠️  Could not read {} from {}: {}", SB_SIG_CARD, path.display(), e);
                None
            }
        }
    }
}

impl ImageRepository for Butler {
    fn resolve(&self, coord: &SkyCoord) -> Result<SurveyImage, ImageResolutionError> {
        let path = self.image_path(coord)?;
        SurveyImage::open(&path)
    }

    fn unique_coords(&self) -> Vec<SkyCoord> {
        let mut seen = std::collections::HashSet::new();
        self.stacks
            .iter()
            .filter(|s| seen.insert(s.field.bits()))
            .map(|s| s.field)
            .collect()
    }
}
