use byteorder::{ByteOrder, LittleEndian};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Extraction quality bits. Only ever OR-combined.
pub mod flags {
    /// Object was split off a larger component by deblending
    pub const MERGED: i64 = 0x0001;
    /// Object footprint touches the image edge
    pub const TRUNC: i64 = 0x0002;
    /// Second moments were singular and have been regularised
    pub const SINGU: i64 = 0x0008;
    /// Photometry aperture runs off the image
    pub const APER_TRUNC: i64 = 0x0010;
    /// Photometry aperture contains no usable pixels
    pub const APER_ALLMASKED: i64 = 0x0040;
    /// Kron moment sum was not positive
    pub const APER_NONPOSITIVE: i64 = 0x0080;
}

/// Number of bytes in the fixed part of a stored record.
pub const RECORD_LEN: usize = 30 * 8;
/// Record length when auto-photometry columns are attached.
pub const RECORD_LEN_WITH_AUTO: usize = RECORD_LEN + 3 * 8;

/// Sky position in degrees (ICRS).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub ra: f64,
    pub dec: f64,
}

impl SkyCoord {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Great-circle separation in degrees (haversine).
    pub fn separation(&self, other: &SkyCoord) -> f64 {
        let (ra1, dec1) = (self.ra.to_radians(), self.dec.to_radians());
        let (ra2, dec2) = (other.ra.to_radians(), other.dec.to_radians());
        let sdec = ((dec2 - dec1) / 2.0).sin();
        let sra = ((ra2 - ra1) / 2.0).sin();
        let h = sdec * sdec + dec1.cos() * dec2.cos() * sra * sra;
        (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
    }

    /// Key used to deduplicate coordinates exactly.
    pub fn bits(&self) -> (u64, u64) {
        (self.ra.to_bits(), self.dec.to_bits())
    }
}

impl fmt::Display for SkyCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(ra={:.5}, dec={:.5})", self.ra, self.dec)
    }
}

/// Elliptical-aperture photometry attached by refinement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoPhotometry {
    pub mag_auto: f64,
    pub flux_auto: f64,
    pub flux_radius: f64,
}

/// One source found by extraction on a single image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub thresh: f64,
    pub npix: i64,
    pub tnpix: i64,
    pub xmin: i64,
    pub xmax: i64,
    pub ymin: i64,
    pub ymax: i64,
    pub x: f64,
    pub y: f64,
    pub x2: f64,
    pub y2: f64,
    pub xy: f64,
    pub errx2: f64,
    pub erry2: f64,
    pub errxy: f64,
    pub a: f64,
    pub b: f64,
    pub theta: f64,
    pub cxx: f64,
    pub cyy: f64,
    pub cxy: f64,
    pub cflux: f64,
    pub flux: f64,
    pub cpeak: f64,
    pub peak: f64,
    pub xcpeak: i64,
    pub ycpeak: i64,
    pub xpeak: i64,
    pub ypeak: i64,
    pub flag: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<AutoPhotometry>,
}

impl DetectedObject {
    /// Convolved flux per footprint pixel.
    pub fn surface_brightness(&self) -> f64 {
        self.cflux / self.npix as f64
    }

    pub fn add_flags(&mut self, bits: i64) {
        self.flag |= bits;
    }

    pub fn has_flag(&self, bits: i64) -> bool {
        self.flag & bits == bits
    }

    /// Little-endian binary record: the 30 fixed fields, then the three
    /// auto-photometry columns when present.
    pub fn to_record_bytes(&self) -> Vec<u8> {
        let mut words: Vec<u64> = vec![
            self.thresh.to_bits(),
            self.npix as u64,
            self.tnpix as u64,
            self.xmin as u64,
            self.xmax as u64,
            self.ymin as u64,
            self.ymax as u64,
            self.x.to_bits(),
            self.y.to_bits(),
            self.x2.to_bits(),
            self.y2.to_bits(),
            self.xy.to_bits(),
            self.errx2.to_bits(),
            self.erry2.to_bits(),
            self.errxy.to_bits(),
            self.a.to_bits(),
            self.b.to_bits(),
            self.theta.to_bits(),
            self.cxx.to_bits(),
            self.cyy.to_bits(),
            self.cxy.to_bits(),
            self.cflux.to_bits(),
            self.flux.to_bits(),
            self.cpeak.to_bits(),
            self.peak.to_bits(),
            self.xcpeak as u64,
            self.ycpeak as u64,
            self.xpeak as u64,
            self.ypeak as u64,
            self.flag as u64,
        ];
        if let Some(auto) = self.auto {
            words.extend([
                auto.mag_auto.to_bits(),
                auto.flux_auto.to_bits(),
                auto.flux_radius.to_bits(),
            ]);
        }
        let mut buf = vec![0u8; words.len() * 8];
        LittleEndian::write_u64_into(&words, &mut buf);
        buf
    }

    /// Inverse of [`DetectedObject::to_record_bytes`]. Returns `None` for a
    /// buffer of the wrong length.
    pub fn from_record_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_LEN && bytes.len() != RECORD_LEN_WITH_AUTO {
            return None;
        }
        let mut raw = vec![0u64; bytes.len() / 8];
        LittleEndian::read_u64_into(bytes, &mut raw);

        let f = |i: usize| f64::from_bits(raw[i]);
        let i = |i: usize| raw[i] as i64;
        let auto = (raw.len() == 33).then(|| AutoPhotometry {
            mag_auto: f(30),
            flux_auto: f(31),
            flux_radius: f(32),
        });
        Some(Self {
            thresh: f(0),
            npix: i(1),
            tnpix: i(2),
            xmin: i(3),
            xmax: i(4),
            ymin: i(5),
            ymax: i(6),
            x: f(7),
            y: f(8),
            x2: f(9),
            y2: f(10),
            xy: f(11),
            errx2: f(12),
            erry2: f(13),
            errxy: f(14),
            a: f(15),
            b: f(16),
            theta: f(17),
            cxx: f(18),
            cyy: f(19),
            cxy: f(20),
            cflux: f(21),
            flux: f(22),
            cpeak: f(23),
            peak: f(24),
            xcpeak: i(25),
            ycpeak: i(26),
            xpeak: i(27),
            ypeak: i(28),
            flag: i(29),
            auto,
        })
    }
}

/// Pixel sub-array cut around a candidate, with its origin in the parent image.
#[derive(Debug, Clone, PartialEq)]
pub struct Cutout {
    pub x0: usize,
    pub y0: usize,
    pub data: DMatrix<f64>,
}

impl Cutout {
    /// Slice the inclusive bounding box of `object`, grown by `padding` and
    /// clamped to the image.
    pub fn from_object(data: &DMatrix<f64>, object: &DetectedObject, padding: usize) -> Self {
        let (rows, cols) = data.shape();
        let pad = padding as i64;
        let clamp = |v: i64, hi: usize| v.clamp(0, hi.saturating_sub(1) as i64) as usize;
        let x0 = clamp(object.xmin - pad, cols);
        let x1 = clamp(object.xmax + pad, cols);
        let y0 = clamp(object.ymin - pad, rows);
        let y1 = clamp(object.ymax + pad, rows);
        let view = data.view((y0, x0), (y1 - y0 + 1, x1 - x0 + 1));
        Self {
            x0,
            y0,
            data: view.into_owned(),
        }
    }

    /// Width and height in pixels.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.data.ncols(), self.data.nrows())
    }
}

/// An object accepted by a selection strategy, ready to be persisted.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub coord: SkyCoord,
    pub object: DetectedObject,
    pub cutout: Cutout,
}

/// One row of the durable candidate store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFinding {
    pub id: String,
    pub hash: String,
    pub ra: f64,
    pub dec: f64,
    pub object: DetectedObject,
}

#[cfg(test)]
pub(crate) fn test_object(x: f64, y: f64, npix: i64, cflux: f64) -> DetectedObject {
    DetectedObject {
        thresh: 1.5,
        npix,
        tnpix: npix,
        xmin: (x - 5.0) as i64,
        xmax: (x + 5.0) as i64,
        ymin: (y - 5.0) as i64,
        ymax: (y + 5.0) as i64,
        x,
        y,
        x2: 4.0,
        y2: 4.0,
        xy: 0.0,
        errx2: 0.01,
        erry2: 0.01,
        errxy: 0.0,
        a: 2.0,
        b: 2.0,
        theta: 0.0,
        cxx: 0.25,
        cyy: 0.25,
        cxy: 0.0,
        cflux,
        flux: cflux,
        cpeak: cflux / npix as f64,
        peak: cflux / npix as f64,
        xcpeak: x as i64,
        ycpeak: y as i64,
        xpeak: x as i64,
        ypeak: y as i64,
        flag: 0,
        auto: None,
    }
}
