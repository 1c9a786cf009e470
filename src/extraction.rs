//! Source catalog extraction.
//!
//! Subtracts the spatial background, convolves the residual with a small
//! smoothing kernel, and segments the result at `thresh × global_rms` into
//! 8-connected objects. Blended objects are split by multi-threshold
//! deblending before each footprint is measured.
//!
//! # Measurements
//!
//! Positions and second moments are flux weighted on the residual image.
//! `cflux`/`cpeak` come from the convolved detection image, `flux`/`peak`
//! from the residual. Moment errors assume a constant per-pixel variance of
//! `global_rms²`.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::background::{Background, BackgroundParams};
use crate::error::ExtractionError;
use crate::models::{flags, DetectedObject};

/// (row, col)
type Px = (usize, usize);

/// Default 3×3 detection kernel, normalised at application time.
const CONV_KERNEL: [[f64; 3]; 3] = [[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];
const MAX_DEBLEND_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionParams {
    /// Detection threshold in units of the global background RMS
    pub thresh: f64,
    /// Minimum footprint size in pixels
    pub minarea: usize,
    /// Number of deblending levels between threshold and peak
    pub deblend_nthresh: usize,
    /// Minimum flux fraction for a deblended branch
    pub deblend_cont: f64,
    /// Convolve with the default kernel before thresholding
    pub filter: bool,
    /// Upper bound on pixels above threshold in one image
    pub pixel_stack: usize,
    pub background: BackgroundParams,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            thresh: 1.5,
            minarea: 5,
            deblend_nthresh: 32,
            deblend_cont: 0.005,
            filter: true,
            pixel_stack: 300_000,
            background: BackgroundParams::default(),
        }
    }
}

/// Extraction result for one image. Discarded once candidates are written.
#[derive(Debug, Clone)]
pub struct ObjectCatalog {
    pub objects: Vec<DetectedObject>,
    /// Background-subtracted pixels
    pub residual: DMatrix<f64>,
    pub global_back: f64,
    pub global_rms: f64,
    /// Absolute detection threshold used
    pub threshold: f64,
}

impl ObjectCatalog {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

pub fn extract_catalog(
    data: &DMatrix<f64>,
    params: &ExtractionParams,
) -> Result<ObjectCatalog, ExtractionError> {
    let background = Background::estimate(data, &params.background)?;
    let residual = background.subtract(data);
    let detect = if params.filter {
        convolve(&residual)
    } else {
        residual.clone()
    };
    let threshold = params.thresh * background.global_rms();
    let (rows, cols) = residual.shape();

    let mut above = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            if detect[(r, c)] > threshold {
                above.push((r, c));
            }
        }
    }
    if above.len() > params.pixel_stack {
        return Err(ExtractionError::PixelStackOverflow {
            used: above.len(),
            limit: params.pixel_stack,
        });
    }

    let variance = background.global_rms().powi(2);
    let mut objects = Vec::new();
    for component in connected_components(&above) {
        if component.len() < params.minarea.max(1) {
            continue;
        }
        let pieces = deblend(component, &detect, threshold, params);
        let merged = pieces.len() > 1;
        for piece in pieces {
            let mut obj = measure(&piece, &residual, &detect, threshold, variance);
            if merged {
                obj.add_flags(flags::MERGED);
            }
            objects.push(obj);
        }
    }

    tracing::debug!(
        "🔭 Extracted {} objects ({} pixels above {:.4})",
        objects.len(),
        above.len(),
        threshold
    );

    Ok(ObjectCatalog {
        objects,
        residual,
        global_back: background.global_back(),
        global_rms: background.global_rms(),
        threshold,
    })
}

/// 3×3 convolution, renormalised over the in-bounds part of the kernel.
fn convolve(image: &DMatrix<f64>) -> DMatrix<f64> {
    let (rows, cols) = image.shape();
    DMatrix::from_fn(rows, cols, |r, c| {
        let mut sum = 0.0;
        let mut weight = 0.0;
        for (kr, krow) in CONV_KERNEL.iter().enumerate() {
            for (kc, k) in krow.iter().enumerate() {
                let (rr, cc) = (r as i64 + kr as i64 - 1, c as i64 + kc as i64 - 1);
                if rr >= 0 && cc >= 0 && (rr as usize) < rows && (cc as usize) < cols {
                    sum += k * image[(rr as usize, cc as usize)];
                    weight += k;
                }
            }
        }
        sum / weight
    })
}

/// 8-connected components of a pixel set, in scan order of their first pixel.
fn connected_components(pixels: &[Px]) -> Vec<Vec<Px>> {
    let Some(&(first_r, first_c)) = pixels.first() else {
        return Vec::new();
    };
    let (mut r0, mut r1, mut c0, mut c1) = (first_r, first_r, first_c, first_c);
    for &(r, c) in pixels {
        r0 = r0.min(r);
        r1 = r1.max(r);
        c0 = c0.min(c);
        c1 = c1.max(c);
    }
    let (h, w) = (r1 - r0 + 1, c1 - c0 + 1);
    const ABSENT: u32 = u32::MAX;
    const PRESENT: u32 = u32::MAX - 1;
    let mut grid = vec![ABSENT; h * w];
    for &(r, c) in pixels {
        grid[(r - r0) * w + (c - c0)] = PRESENT;
    }

    let mut components = Vec::new();
    let mut stack = Vec::new();
    for &(r, c) in pixels {
        let idx = (r - r0) * w + (c - c0);
        if grid[idx] != PRESENT {
            continue;
        }
        let label = components.len() as u32;
        grid[idx] = label;
        stack.push((r - r0, c - c0));
        let mut members = Vec::new();
        while let Some((lr, lc)) = stack.pop() {
            members.push((lr + r0, lc + c0));
            for dr in -1i64..=1 {
                for dc in -1i64..=1 {
                    let (nr, nc) = (lr as i64 + dr, lc as i64 + dc);
                    if nr < 0 || nc < 0 || nr >= h as i64 || nc >= w as i64 {
                        continue;
                    }
                    let nidx = nr as usize * w + nc as usize;
                    if grid[nidx] == PRESENT {
                        grid[nidx] = label;
                        stack.push((nr as usize, nc as usize));
                    }
                }
            }
        }
        members.sort_unstable();
        components.push(members);
    }
    components
}

/// Split a blended component. Returns the component unchanged when no
/// significant split exists.
fn deblend(
    component: Vec<Px>,
    detect: &DMatrix<f64>,
    threshold: f64,
    params: &ExtractionParams,
) -> Vec<Vec<Px>> {
    if params.deblend_nthresh <= 1 {
        return vec![component];
    }
    let total: f64 = component.iter().map(|&p| detect[p]).sum();
    let min_flux = params.deblend_cont * total;
    let mut seeds = Vec::new();
    collect_branches(&component, threshold, detect, params, min_flux, 0, &mut seeds);
    if seeds.len() < 2 {
        return vec![component];
    }
    assign_to_seeds(component, &seeds, detect)
}

/// Walk thresholds upwards from `base` and collect leaf branches.
fn collect_branches(
    pixels: &[Px],
    base: f64,
    detect: &DMatrix<f64>,
    params: &ExtractionParams,
    min_flux: f64,
    depth: usize,
    leaves: &mut Vec<Vec<Px>>,
) {
    let peak = pixels.iter().map(|&p| detect[p]).fold(f64::NEG_INFINITY, f64::max);
    if depth >= MAX_DEBLEND_DEPTH || base <= 0.0 || peak <= base {
        leaves.push(pixels.to_vec());
        return;
    }
    let n = params.deblend_nthresh as f64;
    for i in 1..params.deblend_nthresh {
        let level = base * (peak / base).powf(i as f64 / n);
        let subset: Vec<Px> = pixels.iter().copied().filter(|&p| detect[p] > level).collect();
        let significant: Vec<Vec<Px>> = connected_components(&subset)
            .into_iter()
            .filter(|branch| {
                branch.len() >= params.minarea.max(1)
                    && branch.iter().map(|&p| detect[p]).sum::<f64>() >= min_flux
            })
            .collect();
        if significant.len() >= 2 {
            for branch in significant {
                collect_branches(&branch, level, detect, params, min_flux, depth + 1, leaves);
            }
            return;
        }
    }
    leaves.push(pixels.to_vec());
}

struct Seed {
    x: f64,
    y: f64,
    s2: f64,
    norm: f64,
}

/// Give each pixel of the component to the seed with the highest
/// flux-weighted Gaussian likelihood. Seed pixels stay with their seed.
fn assign_to_seeds(component: Vec<Px>, seeds: &[Vec<Px>], detect: &DMatrix<f64>) -> Vec<Vec<Px>> {
    let profiles: Vec<Seed> = seeds
        .iter()
        .map(|pixels| {
            let flux: f64 = pixels.iter().map(|&p| detect[p]).sum();
            let (mut sx, mut sy) = (0.0, 0.0);
            for &(r, c) in pixels {
                let w = detect[(r, c)];
                sx += w * c as f64;
                sy += w * r as f64;
            }
            let (x, y) = (sx / flux, sy / flux);
            let mut s2 = 0.0;
            for &(r, c) in pixels {
                let w = detect[(r, c)];
                s2 += w * ((c as f64 - x).powi(2) + (r as f64 - y).powi(2));
            }
            let s2 = (s2 / flux / 2.0).max(1.0);
            Seed {
                x,
                y,
                s2,
                norm: flux / (2.0 * std::f64::consts::PI * s2),
            }
        })
        .collect();

    let mut owner = std::collections::HashMap::new();
    for (i, pixels) in seeds.iter().enumerate() {
        for &p in pixels {
            owner.insert(p, i);
        }
    }

    let mut out: Vec<Vec<Px>> = vec![Vec::new(); seeds.len()];
    for p in component {
        let idx = owner.get(&p).copied().unwrap_or_else(|| {
            let (r, c) = p;
            profiles
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let d2 = (c as f64 - s.x).powi(2) + (r as f64 - s.y).powi(2);
                    (i, s.norm * (-d2 / (2.0 * s.s2)).exp())
                })
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(i, _)| i)
                .unwrap_or(0)
        });
        out[idx].push(p);
    }
    out.retain(|pixels| !pixels.is_empty());
    out
}

fn measure(
    pixels: &[Px],
    residual: &DMatrix<f64>,
    detect: &DMatrix<f64>,
    threshold: f64,
    variance: f64,
) -> DetectedObject {
    let (rows, cols) = residual.shape();
    let (mut xmin, mut xmax, mut ymin, mut ymax) = (usize::MAX, 0, usize::MAX, 0);
    let (mut flux, mut cflux) = (0.0, 0.0);
    let (mut peak, mut cpeak) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    let (mut xpeak, mut ypeak, mut xcpeak, mut ycpeak) = (0, 0, 0, 0);
    let mut tnpix = 0i64;
    for &(r, c) in pixels {
        let v = residual[(r, c)];
        let cv = detect[(r, c)];
        xmin = xmin.min(c);
        xmax = xmax.max(c);
        ymin = ymin.min(r);
        ymax = ymax.max(r);
        flux += v;
        cflux += cv;
        if v > threshold {
            tnpix += 1;
        }
        if v > peak {
            peak = v;
            xpeak = c;
            ypeak = r;
        }
        if cv > cpeak {
            cpeak = cv;
            xcpeak = c;
            ycpeak = r;
        }
    }

    // Flux-weighted moments; fall back to uniform weights for non-positive totals
    let uniform = flux <= 0.0;
    let weight = |p: &Px| if uniform { 1.0 } else { residual[*p] };
    let wsum: f64 = pixels.iter().map(weight).sum();
    let x = pixels.iter().map(|p| weight(p) * p.1 as f64).sum::<f64>() / wsum;
    let y = pixels.iter().map(|p| weight(p) * p.0 as f64).sum::<f64>() / wsum;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    let (mut exx, mut eyy, mut exy) = (0.0, 0.0, 0.0);
    for p in pixels {
        let (dx, dy) = (p.1 as f64 - x, p.0 as f64 - y);
        let w = weight(p);
        sxx += w * dx * dx;
        syy += w * dy * dy;
        sxy += w * dx * dy;
        exx += dx * dx;
        eyy += dy * dy;
        exy += dx * dy;
    }
    let mut x2 = sxx / wsum;
    let mut y2 = syy / wsum;
    let xy = sxy / wsum;

    let mut flag = 0;
    if x2 * y2 - xy * xy < 1.0 / 144.0 {
        x2 += 1.0 / 12.0;
        y2 += 1.0 / 12.0;
        flag |= flags::SINGU;
    }
    if xmin == 0 || ymin == 0 || xmax + 1 == cols || ymax + 1 == rows {
        flag |= flags::TRUNC;
    }

    let (a, b, theta) = ellipse_axes(x2, y2, xy);
    let det = x2 * y2 - xy * xy;
    let err_norm = variance / (wsum * wsum);

    DetectedObject {
        thresh: threshold,
        npix: pixels.len() as i64,
        tnpix,
        xmin: xmin as i64,
        xmax: xmax as i64,
        ymin: ymin as i64,
        ymax: ymax as i64,
        x,
        y,
        x2,
        y2,
        xy,
        errx2: exx * err_norm,
        erry2: eyy * err_norm,
        errxy: exy * err_norm,
        a,
        b,
        theta,
        cxx: y2 / det,
        cyy: x2 / det,
        cxy: -2.0 * xy / det,
        cflux,
        flux,
        cpeak,
        peak,
        xcpeak: xcpeak as i64,
        ycpeak: ycpeak as i64,
        xpeak: xpeak as i64,
        ypeak: ypeak as i64,
        flag,
        auto: None,
    }
}

/// Semi-major, semi-minor axis and position angle from second moments.
pub fn ellipse_axes(x2: f64, y2: f64, xy: f64) -> (f64, f64, f64) {
    let half_sum = (x2 + y2) / 2.0;
    let half_diff = (x2 - y2) / 2.0;
    let root = (half_diff * half_diff + xy * xy).sqrt();
    let a = (half_sum + root).max(0.0).sqrt();
    let b = (half_sum - root).max(0.0).sqrt();
    let theta = 0.5 * (2.0 * xy).atan2(x2 - y2);
    (a, b, theta)
}
