use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::extraction::ExtractionParams;
use crate::photometry::PhotometryParams;
use crate::ring_filter::RingFilterParams;
use crate::scanner::ScanOptions;
use crate::selection::{SelectionConfig, StrategyKind};

const DEFAULT_SOURCE: &str = "./stacks";
const DEFAULT_PROCESSES: usize = 4;

/// Main configuration structure for a scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Input and output locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Worker pool and per-coordinate options
    #[serde(default)]
    pub scan: ScanConfig,
    /// Candidate selection heuristics
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Annulus median applied before detection
    #[serde(default)]
    pub ring_filter: RingFilterParams,
    /// Background and source detection
    #[serde(default)]
    pub extraction: ExtractionParams,
    /// Auto-photometry apertures
    #[serde(default)]
    pub photometry: PhotometryParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the survey stacks
    pub source: String,
    /// Run output directory (default: next free `./out<N>`)
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Selection strategy (default: surface-brightness)
    pub strategy: Option<StrategyKind>,
    /// Worker pool size (default: 4)
    pub processes: Option<usize>,
    /// Only scan the first N coordinates
    pub max_processed: Option<usize>,
    /// Per-coordinate time limit as human readable time, e.g. "90s"
    pub task_timeout: Option<String>,
    /// Attach auto-photometry to accepted candidates (default: true)
    pub photometry: Option<bool>,
    /// Pixels added around each cutout's bounding box (default: 0)
    pub cutout_padding: Option<usize>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            output_dir: None,
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ScanOverrides {
    pub source: Option<String>,
    pub output_dir: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub processes: Option<usize>,
    pub max_processed: Option<usize>,
    pub max_tries: Option<usize>,
    pub max_findings: Option<usize>,
    pub task_timeout: Option<String>,
    pub no_photometry: bool,
    pub skip_corner_filter: bool,
    pub no_ring_filter: bool,
}

/// First `out<N>` under `parent` that does not exist yet, starting from the
/// number of entries already named `out*`.
pub fn default_output_dir(parent: &Path) -> PathBuf {
    let existing = std::fs::read_dir(parent)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("out"))
                .count()
        })
        .unwrap_or(0);
    let mut n = existing;
    loop {
        let candidate = parent.join(format!("out{}", n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml_edit::de::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_string = toml_edit::ser::to_string_pretty(self)
            .context("Failed to serialize configuration to TOML")?;

        std::fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Merge configuration with command line arguments, prioritizing CLI values
    pub fn merge_with_cli(&mut self, cli: ScanOverrides) {
        if let Some(source) = cli.source {
            self.paths.source = source;
        }
        if let Some(dir) = cli.output_dir {
            self.paths.output_dir = Some(dir);
        }
        if let Some(strategy) = cli.strategy {
            self.scan.strategy = Some(strategy);
        }
        if let Some(processes) = cli.processes {
            self.scan.processes = Some(processes);
        }
        if let Some(max) = cli.max_processed {
            self.scan.max_processed = Some(max);
        }
        if let Some(timeout) = cli.task_timeout {
            self.scan.task_timeout = Some(timeout);
        }
        if let Some(tries) = cli.max_tries {
            self.selection.max_tries = tries;
        }
        if let Some(findings) = cli.max_findings {
            self.selection.max_findings = findings;
        }
        if cli.no_photometry {
            self.scan.photometry = Some(false);
        }
        if cli.skip_corner_filter {
            self.selection.skip_corner_filter = true;
        }
        if cli.no_ring_filter {
            self.ring_filter.do_ring_filter = false;
        }
    }

    /// Get the effective values with defaults applied
    pub fn get_strategy(&self) -> StrategyKind {
        self.scan.strategy.unwrap_or(StrategyKind::SurfaceBrightness)
    }

    pub fn get_processes(&self) -> usize {
        self.scan.processes.unwrap_or(DEFAULT_PROCESSES)
    }

    pub fn get_photometry(&self) -> bool {
        self.scan.photometry.unwrap_or(true)
    }

    pub fn get_cutout_padding(&self) -> usize {
        self.scan.cutout_padding.unwrap_or(0)
    }

    /// `None` when unset or unparsable; `validate` reports the latter.
    pub fn get_task_timeout(&self) -> Option<Duration> {
        self.scan
            .task_timeout
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    pub fn get_source(&self) -> PathBuf {
        PathBuf::from(&self.paths.source)
    }

    pub fn get_output_dir(&self) -> PathBuf {
        match &self.paths.output_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_output_dir(Path::new(".")),
        }
    }

    /// Worker options for the scanner.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            processes: self.get_processes(),
            max_processed: self.scan.max_processed,
            task_timeout: self.get_task_timeout(),
            photometry: self.get_photometry(),
            cutout_padding: self.get_cutout_padding(),
            ring_filter: self.ring_filter,
            extraction: self.extraction.clone(),
            photometry_params: self.photometry,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let processes = self.get_processes();
        if processes < 1 {
            return Err(ConfigurationError::TooSmall {
                field: "processes",
                min: 1,
                value: processes,
            });
        }
        if let Some(max) = self.scan.max_processed {
            if max < 1 {
                return Err(ConfigurationError::TooSmall {
                    field: "max_processed",
                    min: 1,
                    value: max,
                });
            }
        }

        if let Some(ref timeout) = self.scan.task_timeout {
            match humantime::parse_duration(timeout) {
                Ok(d) if !d.is_zero() => {}
                _ => return Err(ConfigurationError::Timeout(timeout.clone())),
            }
        }

        self.selection.validate()?;

        let ring = &self.ring_filter;
        if ring.do_ring_filter
            && !(ring.r_inner >= 0.0 && ring.r_outer > ring.r_inner && ring.r_outer.is_finite())
        {
            return Err(ConfigurationError::RingRadii {
                inner: ring.r_inner,
                outer: ring.r_outer,
            });
        }

        let ex = &self.extraction;
        if !(ex.thresh > 0.0) || !ex.thresh.is_finite() {
            return Err(ConfigurationError::NotPositive {
                field: "extraction.thresh",
                value: ex.thresh,
            });
        }
        for (field, value) in [
            ("extraction.minarea", ex.minarea),
            ("extraction.deblend_nthresh", ex.deblend_nthresh),
            ("extraction.background.bw", ex.background.bw),
            ("extraction.background.bh", ex.background.bh),
            ("extraction.background.fw", ex.background.fw),
            ("extraction.background.fh", ex.background.fh),
        ] {
            if value < 1 {
                return Err(ConfigurationError::TooSmall { field, min: 1, value });
            }
        }

        let source = Path::new(&self.paths.source);
        if !source.exists() {
            return Err(ConfigurationError::MissingSource(self.paths.source.clone()));
        }
        if !source.is_dir() {
            return Err(ConfigurationError::SourceNotDirectory(
                self.paths.source.clone(),
            ));
        }

        Ok(())
    }
}
