use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::butler::{Butler, ImageRepository};
use crate::cli::{Cli, Commands, ListFormat};
use crate::config::{Config, ScanOverrides};
use crate::db::CatalogReader;
use crate::models::{Cutout, SkyCoord, StoredFinding};
use crate::scanner::{self, process_coordinate, ScanRun};

pub fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Scan { config, overrides } => {
            let mut app_config = load_config(config.as_deref())?;
            app_config.merge_with_cli(overrides.into());
            app_config
                .validate()
                .context("Configuration validation failed")?;

            let source = app_config.get_source();
            let butler = Butler::open(&source)
                .with_context(|| format!("Failed to index stacks in {}", source.display()))?;
            let coords = butler.unique_coords();

            let config_json =
                serde_json::to_string(&app_config).context("Failed to serialize configuration")?;
            let run = ScanRun::new(
                coords,
                app_config.get_strategy(),
                app_config.selection.clone(),
                app_config.scan_options(),
                app_config.get_output_dir(),
            )
            .with_config_json(config_json);

            // Use tokio runtime for the worker pool
            let runtime = tokio::runtime::Runtime::new()?;
            let result = runtime.block_on(scanner::execute(Arc::new(butler), &run));
            // Timed-out units may still hold blocking threads; do not wait for them
            runtime.shutdown_background();
            let summary = result.context("Scan aborted")?;

            println!("{}", summary);
            println!("Output: {}", run.output_dir.display());
        }
        Commands::Find {
            ra,
            dec,
            config,
            source,
            strategy,
            json,
        } => {
            let mut app_config = load_config(config.as_deref())?;
            app_config.merge_with_cli(ScanOverrides {
                source,
                strategy,
                ..Default::default()
            });
            app_config
                .validate()
                .context("Configuration validation failed")?;
            find_candidates(&app_config, SkyCoord::new(ra, dec), json)?;
        }
        Commands::List { dir, format } => {
            let reader = CatalogReader::open(Path::new(&dir))
                .with_context(|| format!("Failed to open candidate store in {}", dir))?;
            let findings = reader.load()?;
            list_findings(&findings, format)?;
            if format == ListFormat::Table {
                if let Some(run) = reader.latest_run()? {
                    println!(
                        "\nRun {} ({}) started {} finished {}",
                        run.id,
                        run.strategy,
                        run.started_at,
                        run.finished_at.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Cutout { dir, id } => {
            let reader = CatalogReader::open(Path::new(&dir))
                .with_context(|| format!("Failed to open candidate store in {}", dir))?;
            let finding = reader.get(&id)?;
            let cutout = reader.get_cutout_by_name(&id)?;
            show_cutout(&finding, &cutout);
        }
        Commands::InitConfig { path, force } => {
            if Path::new(&path).exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path);
            }
            Config::default().to_file(&path)?;
            println!("Wrote default configuration to {}", path);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path)),
        None => Ok(Config::default()),
    }
}

fn find_candidates(config: &Config, coord: SkyCoord, json: bool) -> Result<()> {
    let butler = Butler::open(&config.get_source())?;
    let path = butler.image_path(&coord)?;
    tracing::info!("🔭 {} resolves to {}", coord, path.display());

    let strategy = config.get_strategy().build(config.selection.clone());
    let output = process_coordinate(&butler, &coord, strategy.as_ref(), &config.scan_options())?;

    if json {
        let rows: Vec<serde_json::Value> = output
            .candidates
            .iter()
            .map(|c| {
                serde_json::json!({
                    "ra": c.coord.ra,
                    "dec": c.coord.dec,
                    "cutout": { "x0": c.cutout.x0, "y0": c.cutout.y0, "size": c.cutout.dimensions() },
                    "object": c.object,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{}: {} objects detected, {} candidates ({})",
        output.image_path.display(),
        output.detected,
        output.candidates.len(),
        strategy.name()
    );
    match output.wcs.sky_to_pix(&coord) {
        Some((x, y)) => println!("{} lies at pixel ({:.1}, {:.1})", coord, x, y),
        None => println!("{} does not project onto this stack", coord),
    }
    println!(
        "{:<4} {:>11} {:>11} {:>8} {:>8} {:>6} {:>10} {:>8}",
        "#", "RA", "Dec", "x", "y", "npix", "cflux", "mag"
    );
    for (i, c) in output.candidates.iter().enumerate() {
        println!(
            "{:<4} {:>11.6} {:>11.6} {:>8.1} {:>8.1} {:>6} {:>10.1} {:>8}",
            i,
            c.coord.ra,
            c.coord.dec,
            c.object.x,
            c.object.y,
            c.object.npix,
            c.object.cflux,
            format_mag(c.object.auto.map(|a| a.mag_auto))
        );
    }
    Ok(())
}

fn format_mag(mag: Option<f64>) -> String {
    match mag {
        Some(m) if m.is_finite() => format!("{:.2}", m),
        Some(_) => "nan".to_string(),
        None => "-".to_string(),
    }
}

fn list_findings(findings: &[StoredFinding], format: ListFormat) -> Result<()> {
    match format {
        ListFormat::Json => {
            println!("{}", serde_json::to_string_pretty(findings)?);
        }
        ListFormat::Csv => {
            println!("id,hash,ra,dec,x,y,npix,cflux,flag,mag_auto,flux_radius");
            for f in findings {
                let (mag, radius) = f
                    .object
                    .auto
                    .map_or((String::new(), String::new()), |a| {
                        (a.mag_auto.to_string(), a.flux_radius.to_string())
                    });
                println!(
                    "{},{},{},{},{},{},{},{},{},{},{}",
                    f.id,
                    f.hash,
                    f.ra,
                    f.dec,
                    f.object.x,
                    f.object.y,
                    f.object.npix,
                    f.object.cflux,
                    f.object.flag,
                    mag,
                    radius
                );
            }
        }
        ListFormat::Table => {
            println!(
                "{:<6} {:<14} {:>11} {:>11} {:>6} {:>10} {:>8} {:>5}",
                "ID", "Hash", "RA", "Dec", "npix", "cflux", "mag", "flag"
            );
            println!("{}", "-".repeat(78));
            for f in findings {
                println!(
                    "{:<6} {:<14} {:>11.6} {:>11.6} {:>6} {:>10.1} {:>8} {:>5}",
                    f.id,
                    f.hash,
                    f.ra,
                    f.dec,
                    f.object.npix,
                    f.object.cflux,
                    format_mag(f.object.auto.map(|a| a.mag_auto)),
                    f.object.flag
                );
            }
            println!("\nTotal: {} candidates", findings.len());
        }
    }
    Ok(())
}

fn show_cutout(finding: &StoredFinding, cutout: &Cutout) {
    let (width, height) = cutout.dimensions();
    println!("Candidate {} at ra={:.6} dec={:.6}", finding.id, finding.ra, finding.dec);
    println!("  Origin: ({}, {})", cutout.x0, cutout.y0);
    println!("  Size: {}x{}", width, height);

    let mut finite: Vec<f64> = cutout.data.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        println!("  No finite pixels");
        return;
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    println!("  Min: {:.3}", finite[0]);
    println!("  Max: {:.3}", finite[finite.len() - 1]);
    println!("  Mean: {:.3}", mean);
    println!("  Median: {:.3}", finite[finite.len() / 2]);
    println!("  Object npix: {} flag: {:#x}", finding.object.npix, finding.object.flag);
}
