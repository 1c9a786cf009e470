//! Smooth spatial background model.
//!
//! The image is tiled into `bw × bh` meshes. Each mesh gets a sigma-clipped
//! mode estimate and RMS, both mesh grids are median filtered, and the
//! background grid is bilinearly interpolated back to full resolution. The
//! RMS grid only feeds the global noise level used for thresholding.
//! Non-finite pixels are ignored everywhere.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundParams {
    /// Mesh width in pixels
    pub bw: usize,
    /// Mesh height in pixels
    pub bh: usize,
    /// Median filter width over the mesh grid
    pub fw: usize,
    /// Median filter height over the mesh grid
    pub fh: usize,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            bw: 64,
            bh: 64,
            fw: 3,
            fh: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Background {
    back: DMatrix<f64>,
    global_back: f64,
    global_rms: f64,
}

const CLIP_SIGMA: f64 = 3.0;
const CLIP_ITERATIONS: usize = 10;

impl Background {
    pub fn estimate(data: &DMatrix<f64>, params: &BackgroundParams) -> Result<Self, ExtractionError> {
        let (rows, cols) = data.shape();
        if rows == 0 || cols == 0 {
            return Err(ExtractionError::EmptyImage);
        }
        let bw = params.bw.clamp(1, cols);
        let bh = params.bh.clamp(1, rows);
        let nx = cols.div_ceil(bw);
        let ny = rows.div_ceil(bh);

        let mut mesh_back: Vec<Option<f64>> = Vec::with_capacity(nx * ny);
        let mut mesh_rms: Vec<Option<f64>> = Vec::with_capacity(nx * ny);
        let mut values = Vec::with_capacity(bw * bh);
        for my in 0..ny {
            for mx in 0..nx {
                values.clear();
                let r1 = ((my + 1) * bh).min(rows);
                let c1 = ((mx + 1) * bw).min(cols);
                for c in mx * bw..c1 {
                    for r in my * bh..r1 {
                        let v = data[(r, c)];
                        if v.is_finite() {
                            values.push(v);
                        }
                    }
                }
                match clipped_mode(&mut values) {
                    Some((mode, sigma)) => {
                        mesh_back.push(Some(mode));
                        mesh_rms.push(Some(sigma));
                    }
                    None => {
                        mesh_back.push(None);
                        mesh_rms.push(None);
                    }
                }
            }
        }

        if mesh_back.iter().all(Option::is_none) {
            return Err(ExtractionError::NoFinitePixels);
        }

        let back_grid = median_filter(&fill_missing(&mesh_back, nx, ny), nx, ny, params.fw, params.fh);
        let rms_grid = median_filter(&fill_missing(&mesh_rms, nx, ny), nx, ny, params.fw, params.fh);

        let global_back = back_grid.iter().sum::<f64>() / back_grid.len() as f64;
        let global_rms = rms_grid.iter().sum::<f64>() / rms_grid.len() as f64;
        if !global_rms.is_finite() || global_rms <= 0.0 {
            return Err(ExtractionError::DegenerateBackground(global_rms));
        }

        let back = interpolate(&back_grid, nx, ny, bw, bh, rows, cols);

        tracing::trace!(
            "🌌 Background mesh {}x{}: global back {:.4}, global rms {:.4}",
            nx,
            ny,
            global_back,
            global_rms
        );

        Ok(Self {
            back,
            global_back,
            global_rms,
        })
    }

    pub fn global_back(&self) -> f64 {
        self.global_back
    }

    pub fn global_rms(&self) -> f64 {
        self.global_rms
    }

    pub fn back(&self) -> &DMatrix<f64> {
        &self.back
    }

    /// `data - background`, non-finite pixels become zero.
    pub fn subtract(&self, data: &DMatrix<f64>) -> DMatrix<f64> {
        data.zip_map(&self.back, |v, b| if v.is_finite() { v - b } else { 0.0 })
    }
}

/// Sigma-clipped (mode, rms) of a mesh. Returns `None` for an empty mesh.
fn clipped_mode(values: &mut Vec<f64>) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut lo = f64::NEG_INFINITY;
    let mut hi = f64::INFINITY;
    let (mut mean, mut sigma) = (0.0, 0.0);
    for _ in 0..CLIP_ITERATIONS {
        let kept = values.iter().filter(|v| **v >= lo && **v <= hi);
        let (n, sum, sum2) = kept.fold((0usize, 0.0, 0.0), |(n, s, s2), v| (n + 1, s + v, s2 + v * v));
        if n == 0 {
            break;
        }
        mean = sum / n as f64;
        sigma = (sum2 / n as f64 - mean * mean).max(0.0).sqrt();
        let (new_lo, new_hi) = (mean - CLIP_SIGMA * sigma, mean + CLIP_SIGMA * sigma);
        if new_lo == lo && new_hi == hi {
            break;
        }
        lo = new_lo;
        hi = new_hi;
    }
    values.retain(|v| *v >= lo && *v <= hi);
    if values.is_empty() {
        return Some((mean, sigma));
    }
    let median = median(values);
    let mode = if sigma > 0.0 && ((mean - median) / sigma).abs() < 0.3 {
        2.5 * median - 1.5 * mean
    } else {
        median
    };
    Some((mode, sigma))
}

pub(crate) fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Replace empty meshes with the nearest populated one.
fn fill_missing(grid: &[Option<f64>], nx: usize, ny: usize) -> Vec<f64> {
    let populated: Vec<(usize, usize, f64)> = (0..ny)
        .flat_map(|y| (0..nx).map(move |x| (x, y)))
        .filter_map(|(x, y)| grid[y * nx + x].map(|v| (x, y, v)))
        .collect();
    (0..nx * ny)
        .map(|idx| {
            grid[idx].unwrap_or_else(|| {
                let (x, y) = ((idx % nx) as i64, (idx / nx) as i64);
                populated
                    .iter()
                    .min_by_key(|(px, py, _)| (*px as i64 - x).pow(2) + (*py as i64 - y).pow(2))
                    .map(|(_, _, v)| *v)
                    .unwrap_or(0.0)
            })
        })
        .collect()
}

/// Index into `0..n` with the grid mirrored about its outer edges
/// (`d c b a | a b c d | d c b a`).
pub(crate) fn reflect(i: i64, n: usize) -> usize {
    let n = n as i64;
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - 1 - m }) as usize
}

/// Median filter over the mesh grid. Edge windows are filled by reflection
/// so a gradient keeps its slope up to the border.
fn median_filter(grid: &[f64], nx: usize, ny: usize, fw: usize, fh: usize) -> Vec<f64> {
    if fw <= 1 && fh <= 1 {
        return grid.to_vec();
    }
    let (hx, hy) = ((fw / 2) as i64, (fh / 2) as i64);
    let mut window = Vec::with_capacity(fw * fh);
    let mut out = Vec::with_capacity(grid.len());
    for y in 0..ny as i64 {
        for x in 0..nx as i64 {
            window.clear();
            for dy in -hy..=hy {
                for dx in -hx..=hx {
                    let (xx, yy) = (reflect(x + dx, nx), reflect(y + dy, ny));
                    window.push(grid[yy * nx + xx]);
                }
            }
            out.push(median(&mut window));
        }
    }
    out
}

fn interpolate(
    grid: &[f64],
    nx: usize,
    ny: usize,
    bw: usize,
    bh: usize,
    rows: usize,
    cols: usize,
) -> DMatrix<f64> {
    // Mesh centres sit at (i + 0.5) * size - 0.5 in pixel coordinates
    let axis = |p: usize, size: usize, n: usize| -> (usize, usize, f64) {
        let f = ((p as f64 + 0.5) / size as f64 - 0.5).clamp(0.0, (n - 1) as f64);
        let i0 = f.floor() as usize;
        let i1 = (i0 + 1).min(n - 1);
        (i0, i1, f - i0 as f64)
    };
    DMatrix::from_fn(rows, cols, |r, c| {
        let (x0, x1, tx) = axis(c, bw, nx);
        let (y0, y1, ty) = axis(r, bh, ny);
        let v00 = grid[y0 * nx + x0];
        let v01 = grid[y0 * nx + x1];
        let v10 = grid[y1 * nx + x0];
        let v11 = grid[y1 * nx + x1];
        let top = v00 + (v01 - v00) * tx;
        let bottom = v10 + (v11 - v10) * tx;
        top + (bottom - top) * ty
    })
}
