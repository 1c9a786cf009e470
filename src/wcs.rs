//! Gnomonic (TAN) world coordinate system read from FITS header cards.
//!
//! Pixel coordinates are 0-based `(x, y)` = `(column, row)`; the 1-based
//! FITS `CRPIX` convention is handled when cards are read or written.

use nalgebra::{Matrix2, Vector2};

use crate::models::SkyCoord;

#[derive(Debug, Clone, PartialEq)]
pub struct Wcs {
    /// Reference pixel, 0-based
    pub crpix: Vector2<f64>,
    /// Reference sky position in degrees (RA, Dec)
    pub crval: Vector2<f64>,
    /// Pixel offset to intermediate world coordinates, degrees per pixel
    pub cd: Matrix2<f64>,
    cd_inv: Matrix2<f64>,
}

impl Wcs {
    /// `None` when `cd` is singular.
    pub fn new(crpix: (f64, f64), crval: (f64, f64), cd: Matrix2<f64>) -> Option<Self> {
        let cd_inv = cd.try_inverse()?;
        Some(Self {
            crpix: Vector2::new(crpix.0, crpix.1),
            crval: Vector2::new(crval.0, crval.1),
            cd,
            cd_inv,
        })
    }

    /// Build from header cards looked up by name.
    ///
    /// Needs `CRVAL1/2`, `CRPIX1/2` and either the `CD` matrix or `CDELT1/2`
    /// with an optional `CROTA2` in degrees.
    pub fn from_cards<F>(card: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let require = |key: &str| card(key).ok_or_else(|| format!("missing {key}"));
        let crval = (require("CRVAL1")?, require("CRVAL2")?);
        let crpix = (require("CRPIX1")? - 1.0, require("CRPIX2")? - 1.0);

        let cd = match (card("CD1_1"), card("CD2_2")) {
            (Some(cd11), Some(cd22)) => Matrix2::new(
                cd11,
                card("CD1_2").unwrap_or(0.0),
                card("CD2_1").unwrap_or(0.0),
                cd22,
            ),
            _ => {
                let cdelt1 = require("CDELT1")?;
                let cdelt2 = require("CDELT2")?;
                let (sin, cos) = card("CROTA2").unwrap_or(0.0).to_radians().sin_cos();
                Matrix2::new(cdelt1 * cos, -cdelt2 * sin, cdelt1 * sin, cdelt2 * cos)
            }
        };

        Self::new(crpix, crval, cd).ok_or_else(|| "CD matrix is singular".to_string())
    }

    /// Header cards describing this transform, with `CRPIX` back in the
    /// 1-based FITS convention.
    pub fn to_cards(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("CRPIX1", self.crpix.x + 1.0),
            ("CRPIX2", self.crpix.y + 1.0),
            ("CRVAL1", self.crval.x),
            ("CRVAL2", self.crval.y),
            ("CD1_1", self.cd[(0, 0)]),
            ("CD1_2", self.cd[(0, 1)]),
            ("CD2_1", self.cd[(1, 0)]),
            ("CD2_2", self.cd[(1, 1)]),
        ]
    }

    /// Same transform for a sub-image whose origin is `(x0, y0)` here.
    pub fn shifted(&self, x0: f64, y0: f64) -> Self {
        Self {
            crpix: self.crpix - Vector2::new(x0, y0),
            ..self.clone()
        }
    }

    pub fn pix_to_sky(&self, x: f64, y: f64) -> SkyCoord {
        let offset = Vector2::new(x, y) - self.crpix;
        let inter = self.cd * offset;
        let (xi, eta) = (inter.x.to_radians(), inter.y.to_radians());

        let ra0 = self.crval.x.to_radians();
        let (sin_dec0, cos_dec0) = self.crval.y.to_radians().sin_cos();
        let denom = cos_dec0 - eta * sin_dec0;
        let ra = ra0 + xi.atan2(denom);
        let dec = (sin_dec0 + eta * cos_dec0).atan2((xi * xi + denom * denom).sqrt());

        SkyCoord::new(ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }

    /// `None` when the position is on the far side of the tangent plane.
    pub fn sky_to_pix(&self, coord: &SkyCoord) -> Option<(f64, f64)> {
        let (sin_dec, cos_dec) = coord.dec.to_radians().sin_cos();
        let (sin_dec0, cos_dec0) = self.crval.y.to_radians().sin_cos();
        let (sin_dra, cos_dra) = (coord.ra - self.crval.x).to_radians().sin_cos();

        let d = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_dra;
        if d <= 0.0 {
            return None;
        }
        let xi = (cos_dec * sin_dra / d).to_degrees();
        let eta = ((sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_dra) / d).to_degrees();

        let pix = self.cd_inv * Vector2::new(xi, eta) + self.crpix;
        Some((pix.x, pix.y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn survey_wcs() -> Wcs {
        // 8"/px, RA increasing to the left
        let scale = 8.0 / 3600.0;
        Wcs::new((1023.5, 1023.5), (150.0, 2.0), Matrix2::new(-scale, 0.0, 0.0, scale)).unwrap()
    }

    #[test]
    fn test_reference_pixel_maps_to_crval() {
        let wcs = survey_wcs();
        let sky = wcs.pix_to_sky(1023.5, 1023.5);
        assert!((sky.ra - 150.0).abs() < 1e-12);
        assert!((sky.dec - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_pixel_sky_round_trip() {
        let wcs = survey_wcs();
        for &(x, y) in &[(0.0, 0.0), (2047.0, 0.0), (100.5, 1900.25), (1024.0, 512.0)] {
            let sky = wcs.pix_to_sky(x, y);
            let (px, py) = wcs.sky_to_pix(&sky).unwrap();
            assert!((px - x).abs() < 1e-6, "{x} -> {px}");
            assert!((py - y).abs() < 1e-6, "{y} -> {py}");
        }
    }

    #[test]
    fn test_orientation() {
        let wcs = survey_wcs();
        let left = wcs.pix_to_sky(0.0, 1023.5);
        let up = wcs.pix_to_sky(1023.5, 2047.0);
        assert!(left.ra > 150.0);
        assert!(up.dec > 2.0);
    }

    #[test]
    fn test_from_cards_with_cd_and_cdelt() {
        let mut cards = HashMap::new();
        cards.insert("CRVAL1", 10.0);
        cards.insert("CRVAL2", -30.0);
        cards.insert("CRPIX1", 1.0);
        cards.insert("CRPIX2", 1.0);
        cards.insert("CDELT1", -0.002);
        cards.insert("CDELT2", 0.002);
        let wcs = Wcs::from_cards(|k| cards.get(k).copied()).unwrap();
        assert_eq!(wcs.crpix, Vector2::new(0.0, 0.0));
        assert_eq!(wcs.cd, Matrix2::new(-0.002, 0.0, 0.0, 0.002));

        cards.insert("CD1_1", -0.001);
        cards.insert("CD2_2", 0.001);
        let wcs = Wcs::from_cards(|k| cards.get(k).copied()).unwrap();
        assert_eq!(wcs.cd, Matrix2::new(-0.001, 0.0, 0.0, 0.001));

        let round: HashMap<_, _> = wcs.to_cards().into_iter().collect();
        assert_eq!(round["CRPIX1"], 1.0);
        assert_eq!(round["CD2_2"], 0.001);
    }

    #[test]
    fn test_from_cards_rejects_bad_headers() {
        let none = Wcs::from_cards(|_| None);
        assert_eq!(none.unwrap_err(), "missing CRVAL1");

        let mut cards = HashMap::new();
        for (k, v) in [("CRVAL1", 1.0), ("CRVAL2", 1.0), ("CRPIX1", 1.0), ("CRPIX2", 1.0)] {
            cards.insert(k, v);
        }
        cards.insert("CD1_1", 0.0);
        cards.insert("CD2_2", 0.0);
        let singular = Wcs::from_cards(|k| cards.get(k).copied());
        assert!(singular.unwrap_err().contains("singular"));
    }

    #[test]
    fn test_shifted_keeps_sky_positions() {
        let wcs = survey_wcs();
        let sub = wcs.shifted(100.0, 200.0);
        let a = wcs.pix_to_sky(150.0, 260.0);
        let b = sub.pix_to_sky(50.0, 60.0);
        assert!((a.ra - b.ra).abs() < 1e-12);
        assert!((a.dec - b.dec).abs() < 1e-12);
    }
}
