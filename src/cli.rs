use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ScanOverrides;
use crate::selection::StrategyKind;

#[derive(Debug, Parser)]
#[command(name = "lbg-scan")]
#[command(about = "Search wide-field survey stacks for low-surface-brightness dwarf galaxy candidates", long_about = None)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan every field of a stack directory and store the candidates
    Scan {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<String>,

        #[command(flatten)]
        overrides: ScanArgs,
    },
    /// Run the pipeline on one coordinate and print the candidates
    Find {
        /// Right ascension in degrees
        #[arg(allow_negative_numbers = true)]
        ra: f64,

        /// Declination in degrees
        #[arg(allow_negative_numbers = true)]
        dec: f64,

        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<String>,

        /// Directory holding the survey stacks
        #[arg(short, long)]
        source: Option<String>,

        /// Selection strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyKind>,

        /// Print candidates as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the candidates of a finished run
    List {
        /// Run output directory
        dir: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },
    /// Show the cutout stored for a candidate
    Cutout {
        /// Run output directory
        dir: String,

        /// Candidate identifier (base 36, any case)
        id: String,
    },
    /// Write a configuration file with every default filled in
    InitConfig {
        /// Destination path
        path: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Command-line overrides for a scan.
#[derive(Debug, Clone, Default, Args)]
pub struct ScanArgs {
    /// Directory holding the survey stacks
    #[arg(short, long)]
    pub source: Option<String>,

    /// Run output directory (default: next free ./out<N>)
    #[arg(short, long)]
    pub output_dir: Option<String>,

    /// Selection strategy
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyKind>,

    /// Number of concurrent workers
    #[arg(short = 'j', long)]
    pub processes: Option<usize>,

    /// Only scan the first N field coordinates
    #[arg(short = 'n', long)]
    pub max_processed: Option<usize>,

    /// Largest objects examined per image
    #[arg(long)]
    pub max_tries: Option<usize>,

    /// Accepted candidates per image (one more is let through)
    #[arg(long)]
    pub max_findings: Option<usize>,

    /// Per-coordinate time limit, e.g. "90s" or "2m"
    #[arg(long)]
    pub task_timeout: Option<String>,

    /// Skip auto-photometry of accepted candidates
    #[arg(long)]
    pub no_photometry: bool,

    /// Keep objects near the image corners
    #[arg(long)]
    pub skip_corner_filter: bool,

    /// Detect on the unfiltered stack
    #[arg(long)]
    pub no_ring_filter: bool,
}

impl From<ScanArgs> for ScanOverrides {
    fn from(args: ScanArgs) -> Self {
        ScanOverrides {
            source: args.source,
            output_dir: args.output_dir,
            strategy: args.strategy,
            processes: args.processes,
            max_processed: args.max_processed,
            max_tries: args.max_tries,
            max_findings: args.max_findings,
            task_timeout: args.task_timeout,
            no_photometry: args.no_photometry,
            skip_corner_filter: args.skip_corner_filter,
            no_ring_filter: args.no_ring_filter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Table,
    Json,
    Csv,
}
