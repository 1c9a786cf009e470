//! Survey stacks and candidate cutouts on disk.
//!
//! Pixels are always handed to the pipeline as native `f64` matrices with
//! `(row, col) = (y, x)`; FITS byte order and integer scaling are resolved
//! here by `fitrs`.

use fitrs::{Fits, FitsData, Hdu, HeaderValue};
use nalgebra::DMatrix;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use crate::error::ImageResolutionError;
use crate::models::{Cutout, SkyCoord};
use crate::wcs::Wcs;

/// Photometric zero-point card.
pub const ZEROPOINT_CARD: &str = "ZEROPT";
/// Surface-brightness significance card used to rank duplicate stacks.
pub const SB_SIG_CARD: &str = "SB_SIG";
/// Cutout origin in the parent stack.
const ORIGIN_CARDS: (&str, &str) = ("CUTX0", "CUTY0");

#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeader {
    pub zeropoint: f64,
    pub sb_sig: Option<f64>,
    pub width: usize,
    pub height: usize,
}

/// A resolved survey stack.
#[derive(Debug, Clone)]
pub struct SurveyImage {
    pub path: PathBuf,
    pub data: DMatrix<f64>,
    pub header: ImageHeader,
    pub wcs: Wcs,
}

fn card_value(hdu: &Hdu, key: &str) -> Option<f64> {
    match hdu.value(key)? {
        HeaderValue::RealFloatingNumber(v) => Some(*v),
        HeaderValue::IntegerNumber(v) => Some(f64::from(*v)),
        HeaderValue::CharacterString(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn primary_hdu(path: &Path) -> Result<Hdu, String> {
    let fits = Fits::open(path).map_err(|e| e.to_string())?;
    fits.get(0).ok_or_else(|| "no primary HDU".to_string())
}

/// Convert the primary array to `(rows, cols)` f64. Blank integers become NaN.
fn read_matrix(hdu: &Hdu) -> Result<DMatrix<f64>, String> {
    let (shape, values): (Vec<usize>, Vec<f64>) = match hdu.read_data() {
        FitsData::FloatingPoint64(arr) => (arr.shape.clone(), arr.data.to_vec()),
        FitsData::FloatingPoint32(arr) => (
            arr.shape.clone(),
            arr.data.iter().map(|v| f64::from(*v)).collect(),
        ),
        FitsData::IntegersI32(arr) => (
            arr.shape.clone(),
            arr.data
                .iter()
                .map(|v| {
                    let v: Option<i32> = *v;
                    v.map_or(f64::NAN, f64::from)
                })
                .collect(),
        ),
        FitsData::IntegersU32(arr) => (
            arr.shape.clone(),
            arr.data
                .iter()
                .map(|v| {
                    let v: Option<u32> = *v;
                    v.map_or(f64::NAN, f64::from)
                })
                .collect(),
        ),
        _ => return Err("unsupported FITS data type".to_string()),
    };

    if shape.len() != 2 {
        return Err(format!("expected a 2-D image, got {} axes", shape.len()));
    }
    let (width, height) = (shape[0], shape[1]);
    if width * height != values.len() {
        return Err(format!(
            "{}x{} image holds {} values",
            width,
            height,
            values.len()
        ));
    }
    Ok(DMatrix::from_row_slice(height, width, &values))
}

impl SurveyImage {
    /// Load pixels, the calibration header and the WCS of a stack.
    pub fn open(path: &Path) -> Result<Self, ImageResolutionError> {
        let read_err = |message: String| ImageResolutionError::Read {
            path: path.to_path_buf(),
            message,
        };
        let hdu = primary_hdu(path).map_err(read_err)?;
        let data = read_matrix(&hdu).map_err(read_err)?;

        let zeropoint =
            card_value(&hdu, ZEROPOINT_CARD).ok_or_else(|| ImageResolutionError::MissingCard {
                path: path.to_path_buf(),
                card: ZEROPOINT_CARD,
            })?;
        let wcs = Wcs::from_cards(|key| card_value(&hdu, key)).map_err(|message| {
            ImageResolutionError::InvalidWcs {
                path: path.to_path_buf(),
                message,
            }
        })?;

        tracing::debug!(
            "📖 Loaded {} ({}x{})",
            path.display(),
            data.ncols(),
            data.nrows()
        );

        Ok(Self {
            path: path.to_path_buf(),
            header: ImageHeader {
                zeropoint,
                sb_sig: card_value(&hdu, SB_SIG_CARD),
                width: data.ncols(),
                height: data.nrows(),
            },
            data,
            wcs,
        })
    }

    /// Sky position of a 0-based pixel coordinate.
    pub fn pix_to_sky(&self, x: f64, y: f64) -> SkyCoord {
        self.wcs.pix_to_sky(x, y)
    }
}

/// Read a single numeric header card without touching the pixels.
pub fn read_card(path: &Path, key: &str) -> Result<Option<f64>, ImageResolutionError> {
    let hdu = primary_hdu(path).map_err(|message| ImageResolutionError::Read {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(card_value(&hdu, key))
}

/// Fixed-width text for a numeric card. At most 20 characters, exact for
/// 13 significant digits; zero and NaN are representable.
pub fn format_card(value: f64) -> String {
    format!("{:.12E}", value)
}

/// Write `data` as the primary HDU of a new FITS file with numeric cards.
///
/// Cards are stored as formatted strings: `fitrs` cannot serialise every
/// `f64` (zero never terminates, long mantissas overflow the value field).
pub fn write_image(path: &Path, data: &DMatrix<f64>, cards: &[(&str, f64)]) -> std::io::Result<()> {
    let (rows, cols) = data.shape();
    let row_major = data.transpose().as_slice().to_vec();
    let mut hdu = Hdu::new(&[cols, rows], row_major);
    for (key, value) in cards {
        hdu.insert(*key, format_card(*value));
    }
    // fitrs panics on some unsupported headers instead of returning an error
    match std::panic::catch_unwind(AssertUnwindSafe(|| Fits::create(path, hdu))) {
        Ok(written) => written.map(|_| ()),
        Err(_) => Err(std::io::Error::other(format!(
            "FITS writer failed on {}",
            path.display()
        ))),
    }
}

/// Write a candidate cutout. The WCS is re-referenced to the cutout origin
/// so sky positions stay valid.
pub fn write_cutout(
    path: &Path,
    cutout: &Cutout,
    header: &ImageHeader,
    wcs: &Wcs,
) -> std::io::Result<()> {
    let mut cards = vec![
        (ZEROPOINT_CARD, header.zeropoint),
        (ORIGIN_CARDS.0, cutout.x0 as f64),
        (ORIGIN_CARDS.1, cutout.y0 as f64),
    ];
    if let Some(sig) = header.sb_sig {
        cards.push((SB_SIG_CARD, sig));
    }
    cards.extend(wcs.shifted(cutout.x0 as f64, cutout.y0 as f64).to_cards());
    write_image(path, &cutout.data, &cards)
}

/// Read a cutout written by [`write_cutout`].
pub fn read_cutout(path: &Path) -> Result<Cutout, String> {
    let hdu = primary_hdu(path)?;
    let data = read_matrix(&hdu)?;
    let origin = |key| card_value(&hdu, key).map_or(0, |v| v.max(0.0) as usize);
    Ok(Cutout {
        x0: origin(ORIGIN_CARDS.0),
        y0: origin(ORIGIN_CARDS.1),
        data,
    })
}
