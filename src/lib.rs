pub mod background;
pub mod butler;
pub mod cli;
pub mod config;
pub mod corners;
pub mod db;
pub mod error;
pub mod extraction;
pub mod image;
pub mod models;
pub mod photometry;
pub mod ring_filter;
pub mod scanner;
pub mod selection;
pub mod utils;
pub mod wcs;

// Main entry point
pub mod cli_main;

// Re-export commonly used items
pub use butler::{Butler, ImageRepository};
pub use image::SurveyImage;
pub use models::{Candidate, DetectedObject, SkyCoord, StoredFinding};
pub use scanner::{ScanSummary, Scanner};
