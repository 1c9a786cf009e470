//! Kron-style automatic aperture photometry.
//!
//! For each object: Kron radius inside the `6·(a, b)` ellipse, flux summed in
//! the ellipse scaled to `2.5 × kron`, magnitude against the image zero-point
//! and the circular half-light radius out to `6·a`.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::models::{flags, AutoPhotometry, DetectedObject};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryParams {
    /// Ellipse scale used to measure the Kron radius
    pub kron_window: f64,
    /// Aperture scale applied to the Kron radius
    pub kron_factor: f64,
    /// Half-light search radius in units of `a`
    pub radius_window: f64,
    /// Flux fraction for the radius solve
    pub radius_fraction: f64,
}

impl Default for PhotometryParams {
    fn default() -> Self {
        Self {
            kron_window: 6.0,
            kron_factor: 2.5,
            radius_window: 6.0,
            radius_fraction: 0.5,
        }
    }
}

/// `zeropoint - 2.5 log10(flux)`, NaN when the flux is not positive.
pub fn magnitude(zeropoint: f64, flux: f64) -> f64 {
    if flux > 0.0 {
        zeropoint - 2.5 * flux.log10()
    } else {
        f64::NAN
    }
}

/// Quadratic-form coefficients of an ellipse with semi-axes `a`, `b` at
/// position angle `theta`.
fn ellipse_coeffs(a: f64, b: f64, theta: f64) -> (f64, f64, f64) {
    let (sin, cos) = theta.sin_cos();
    let (a2, b2) = (a * a, b * b);
    let cxx = cos * cos / a2 + sin * sin / b2;
    let cyy = sin * sin / a2 + cos * cos / b2;
    let cxy = 2.0 * cos * sin * (1.0 / a2 - 1.0 / b2);
    (cxx, cyy, cxy)
}

/// Pixel index window covering radius `extent` around `centre`, and whether
/// it was cut by the image edge.
fn window(centre: f64, extent: f64, len: usize) -> (usize, usize, bool) {
    let lo = (centre - extent).floor();
    let hi = (centre + extent).ceil();
    let truncated = lo < 0.0 || hi > (len as f64 - 1.0);
    let lo = lo.max(0.0) as usize;
    let hi = (hi.max(0.0) as usize).min(len.saturating_sub(1));
    (lo, hi, truncated)
}

/// Sum pixels whose normalised elliptical radius is within `r`, also
/// returning Σ(radius·value) and the pixel count.
fn ellipse_sums(data: &DMatrix<f64>, obj: &DetectedObject, r: f64) -> (f64, f64, usize, bool) {
    let (rows, cols) = data.shape();
    let (a, b) = (obj.a.max(1e-6), obj.b.max(1e-6));
    let (cxx, cyy, cxy) = ellipse_coeffs(a, b, obj.theta);
    let extent = r * a;
    let (x0, x1, tx) = window(obj.x, extent, cols);
    let (y0, y1, ty) = window(obj.y, extent, rows);
    let r2 = r * r;
    let (mut sum, mut rsum, mut count) = (0.0, 0.0, 0usize);
    for row in y0..=y1 {
        for col in x0..=x1 {
            let dx = col as f64 - obj.x;
            let dy = row as f64 - obj.y;
            let rp2 = cxx * dx * dx + cyy * dy * dy + cxy * dx * dy;
            if rp2 <= r2 {
                let v = data[(row, col)];
                if !v.is_finite() {
                    continue;
                }
                sum += v;
                rsum += rp2.sqrt() * v;
                count += 1;
            }
        }
    }
    (sum, rsum, count, tx || ty)
}

/// Kron radius in units of the object's `(a, b)` ellipse, plus flags.
pub fn kron_radius(data: &DMatrix<f64>, obj: &DetectedObject, window_scale: f64) -> (f64, i64) {
    let (sum, rsum, count, _) = ellipse_sums(data, obj, window_scale);
    if count == 0 {
        return (0.0, flags::APER_ALLMASKED);
    }
    if sum <= 0.0 || rsum <= 0.0 {
        return (0.0, flags::APER_NONPOSITIVE);
    }
    (rsum / sum, 0)
}

/// Flux inside the ellipse scaled by `r`.
pub fn sum_ellipse(data: &DMatrix<f64>, obj: &DetectedObject, r: f64) -> (f64, i64) {
    let (sum, _, count, truncated) = ellipse_sums(data, obj, r);
    let mut flag = 0;
    if truncated {
        flag |= flags::APER_TRUNC;
    }
    if count == 0 {
        flag |= flags::APER_ALLMASKED;
    }
    (sum, flag)
}

/// Circular radius enclosing `fraction` of `normflux`, searched out to
/// `rmax`. NaN when the target cannot be reached.
pub fn flux_radius(
    data: &DMatrix<f64>,
    x: f64,
    y: f64,
    rmax: f64,
    fraction: f64,
    normflux: f64,
) -> (f64, i64) {
    let target = fraction * normflux;
    if !(target > 0.0) || !(rmax > 0.0) {
        return (f64::NAN, flags::APER_NONPOSITIVE);
    }
    let (rows, cols) = data.shape();
    let (x0, x1, tx) = window(x, rmax, cols);
    let (y0, y1, ty) = window(y, rmax, rows);
    let mut samples: Vec<(f64, f64)> = Vec::new();
    for row in y0..=y1 {
        for col in x0..=x1 {
            let d = ((col as f64 - x).powi(2) + (row as f64 - y).powi(2)).sqrt();
            let v = data[(row, col)];
            if d <= rmax && v.is_finite() {
                samples.push((d, v));
            }
        }
    }
    samples.sort_by(|a, b| a.0.total_cmp(&b.0));

    let flag = if tx || ty { flags::APER_TRUNC } else { 0 };
    let (mut prev_r, mut prev_sum) = (0.0, 0.0);
    for (d, v) in samples {
        let sum = prev_sum + v;
        if sum >= target {
            let span = sum - prev_sum;
            let t = if span > 0.0 { (target - prev_sum) / span } else { 1.0 };
            return (prev_r + t * (d - prev_r), flag);
        }
        prev_r = d;
        prev_sum = sum;
    }
    (f64::NAN, flag | flags::APER_NONPOSITIVE)
}

/// Measure one object and attach the result. Aperture flags are OR-ed in.
pub fn refine_object(data: &DMatrix<f64>, obj: &mut DetectedObject, zeropoint: f64, params: &PhotometryParams) {
    let (kron, kron_flag) = kron_radius(data, obj, params.kron_window);
    let (flux, sum_flag) = sum_ellipse(data, obj, params.kron_factor * kron);
    let (radius, radius_flag) = flux_radius(
        data,
        obj.x,
        obj.y,
        params.radius_window * obj.a,
        params.radius_fraction,
        flux,
    );
    obj.add_flags(kron_flag | sum_flag | radius_flag);
    obj.auto = Some(AutoPhotometry {
        mag_auto: magnitude(zeropoint, flux),
        flux_auto: flux,
        flux_radius: radius,
    });
}

/// Attach `mag_auto`, `flux_auto` and `flux_radius` to every object in place.
/// Row count and order are unchanged.
pub fn refine(objects: &mut [DetectedObject], data: &DMatrix<f64>, zeropoint: f64, params: &PhotometryParams) {
    for obj in objects.iter_mut() {
        refine_object(data, obj, zeropoint, params);
    }
    tracing::trace!("📏 Auto photometry refined {} objects", objects.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_object;

    fn gaussian_image(size: usize, x: f64, y: f64, sigma: f64, amplitude: f64) -> DMatrix<f64> {
        DMatrix::from_fn(size, size, |r, c| {
            let d2 = (c as f64 - x).powi(2) + (r as f64 - y).powi(2);
            amplitude * (-d2 / (2.0 * sigma * sigma)).exp()
        })
    }

    fn round_object(x: f64, y: f64, sigma: f64) -> DetectedObject {
        let mut obj = test_object(x, y, 100, 1000.0);
        obj.a = sigma;
        obj.b = sigma;
        obj.theta = 0.0;
        obj
    }

    #[test]
    fn test_magnitude_definition() {
        assert_eq!(magnitude(25.0, 100.0), 25.0 - 2.5 * 100f64.log10());
        assert_eq!(magnitude(25.0, 1.0), 25.0);
        assert!(magnitude(25.0, 0.0).is_nan());
        assert!(magnitude(25.0, -10.0).is_nan());
    }

    #[test]
    fn test_gaussian_total_flux_and_half_light_radius() {
        let sigma = 3.0;
        let amplitude = 100.0;
        let data = gaussian_image(101, 50.0, 50.0, sigma, amplitude);
        let mut objects = vec![round_object(50.0, 50.0, sigma)];
        refine(&mut objects, &data, 20.0, &PhotometryParams::default());

        let auto = objects[0].auto.unwrap();
        let total = 2.0 * std::f64::consts::PI * sigma * sigma * amplitude;
        assert!((auto.flux_auto / total - 1.0).abs() < 0.02, "{} vs {}", auto.flux_auto, total);
        // Half-light radius of a Gaussian is sigma * sqrt(2 ln 2)
        let expected = sigma * (2.0 * 2f64.ln()).sqrt();
        assert!((auto.flux_radius - expected).abs() < 0.4, "{}", auto.flux_radius);
        assert_eq!(auto.mag_auto, 20.0 - 2.5 * auto.flux_auto.log10());
        assert_eq!(objects[0].flag & flags::APER_TRUNC, 0);
    }

    #[test]
    fn test_non_positive_flux_gives_nan_magnitude() {
        let data = DMatrix::from_element(64, 64, -1.0);
        let mut objects = vec![round_object(32.0, 32.0, 2.0)];
        refine(&mut objects, &data, 25.0, &PhotometryParams::default());
        let auto = objects[0].auto.unwrap();
        assert!(auto.flux_auto <= 0.0);
        assert!(auto.mag_auto.is_nan());
        assert!(auto.flux_radius.is_nan());
        assert!(objects[0].has_flag(flags::APER_NONPOSITIVE));
    }

    #[test]
    fn test_refine_keeps_rows_and_order() {
        let data = gaussian_image(200, 60.0, 60.0, 2.0, 50.0);
        let mut objects = vec![
            round_object(60.0, 60.0, 2.0),
            round_object(150.0, 150.0, 2.0),
            round_object(100.0, 30.0, 2.0),
        ];
        let xs: Vec<f64> = objects.iter().map(|o| o.x).collect();
        refine(&mut objects, &data, 22.5, &PhotometryParams::default());
        assert_eq!(objects.len(), 3);
        assert_eq!(objects.iter().map(|o| o.x).collect::<Vec<_>>(), xs);
        assert!(objects.iter().all(|o| o.auto.is_some()));
    }

    #[test]
    fn test_edge_aperture_is_flagged_truncated() {
        let data = gaussian_image(64, 2.0, 32.0, 2.0, 80.0);
        let mut obj = round_object(2.0, 32.0, 2.0);
        obj.flag = flags::MERGED;
        refine_object(&data, &mut obj, 25.0, &PhotometryParams::default());
        assert!(obj.has_flag(flags::APER_TRUNC));
        // pre-existing bits survive
        assert!(obj.has_flag(flags::MERGED));
    }

    #[test]
    fn test_kron_radius_of_empty_aperture() {
        let data = DMatrix::from_element(10, 10, f64::NAN);
        let obj = round_object(5.0, 5.0, 1.0);
        let (r, flag) = kron_radius(&data, &obj, 6.0);
        assert_eq!(r, 0.0);
        assert_eq!(flag, flags::APER_ALLMASKED);
    }

    #[test]
    fn test_ellipse_coeffs_for_circle() {
        let (cxx, cyy, cxy) = ellipse_coeffs(2.0, 2.0, 0.3);
        assert!((cxx - 0.25).abs() < 1e-12);
        assert!((cyy - 0.25).abs() < 1e-12);
        assert!(cxy.abs() < 1e-12);
    }
}
