use std::path::PathBuf;
use thiserror::Error;

use crate::models::SkyCoord;

/// A coordinate could not be turned into a usable image.
#[derive(Error, Debug)]
pub enum ImageResolutionError {
    #[error("image repository at {0} contains no survey stacks")]
    EmptyRepository(PathBuf),

    #[error("no image covers {coord}")]
    NoMatch { coord: SkyCoord },

    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("{path} is missing required header card {card}")]
    MissingCard { path: PathBuf, card: &'static str },

    #[error("{path} has an unusable WCS: {message}")]
    InvalidWcs { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Background estimation or source detection failed on a pixel array.
#[derive(Error, Debug, PartialEq)]
pub enum ExtractionError {
    #[error("image has no pixels")]
    EmptyImage,

    #[error("image contains no finite pixels")]
    NoFinitePixels,

    #[error("background RMS is not usable ({0})")]
    DegenerateBackground(f64),

    #[error("detection exceeded the pixel budget ({used} > {limit})")]
    PixelStackOverflow { used: usize, limit: usize },
}

/// The durable candidate store refused a write. Always fatal for a run.
#[derive(Error, Debug)]
pub enum StoreWriteError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} already holds a candidate store")]
    AlreadyExists(PathBuf),
}

/// Run configuration rejected before any processing started.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigurationError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: usize,
        value: usize,
    },

    #[error("percentile window [{0}, {1}] must satisfy 0 <= lo < hi <= 100")]
    Percentiles(usize, usize),

    #[error("source directory does not exist: {0}")]
    MissingSource(String),

    #[error("source path is not a directory: {0}")]
    SourceNotDirectory(String),

    #[error("invalid task_timeout format: {0}")]
    Timeout(String),

    #[error("{field} must be a positive finite number, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("ring filter radii must satisfy 0 <= r_inner < r_outer, got {inner} and {outer}")]
    RingRadii { inner: f64, outer: f64 },
}

/// Per-coordinate failure bucket. The scanner logs these and skips the coordinate.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Resolution(#[from] ImageResolutionError),

    #[error("extraction failed on {path}: {source}")]
    Extraction {
        path: PathBuf,
        #[source]
        source: ExtractionError,
    },

    #[error("worker for {coord} panicked: {message}")]
    WorkerPanic { coord: SkyCoord, message: String },

    #[error("worker for {coord} did not finish within {timeout:?}")]
    Timeout {
        coord: SkyCoord,
        timeout: std::time::Duration,
    },
}

/// Failure reading a persisted catalog back.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("record for {id} has {len} bytes, expected 240 or 264")]
    RecordLength { id: String, len: usize },

    #[error("identifier {0:?} is not base-36")]
    Identifier(String),

    #[error("no stored finding with identifier {0}")]
    UnknownIdentifier(String),

    #[error("cutout {path} could not be read: {message}")]
    Cutout { path: PathBuf, message: String },
}
