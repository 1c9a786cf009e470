//! Scan orchestration: a pool of blocking workers fed through a semaphore,
//! drained by a single collector that owns the store and the identifier
//! counter.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::butler::ImageRepository;
use crate::db::{cutout_path, CatalogStore};
use crate::error::{PipelineError, StoreWriteError};
use crate::extraction::{extract_catalog, ExtractionParams};
use crate::image::{self, ImageHeader};
use crate::models::{Candidate, Cutout, SkyCoord, StoredFinding};
use crate::photometry::{self, PhotometryParams};
use crate::ring_filter::{ring_filter, RingFilterParams};
use crate::selection::{SelectionConfig, SelectionStrategy, StrategyKind};
use crate::utils::{content_hash, to_base36};
use crate::wcs::Wcs;

/// Per-coordinate options shared by every worker of a scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub processes: usize,
    pub max_processed: Option<usize>,
    pub task_timeout: Option<Duration>,
    pub photometry: bool,
    pub cutout_padding: usize,
    pub ring_filter: RingFilterParams,
    pub extraction: ExtractionParams,
    pub photometry_params: PhotometryParams,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            processes: 4,
            max_processed: None,
            task_timeout: None,
            photometry: true,
            cutout_padding: 0,
            ring_filter: RingFilterParams::default(),
            extraction: ExtractionParams::default(),
            photometry_params: PhotometryParams::default(),
        }
    }
}

/// Everything needed to start one scan.
#[derive(Debug, Clone)]
pub struct ScanRun {
    pub coords: Vec<SkyCoord>,
    pub strategy: StrategyKind,
    pub selection: SelectionConfig,
    pub options: ScanOptions,
    pub output_dir: PathBuf,
    /// Serialized configuration recorded in the run table
    pub config_json: String,
}

impl ScanRun {
    pub fn new(
        coords: impl IntoIterator<Item = SkyCoord>,
        strategy: StrategyKind,
        selection: SelectionConfig,
        options: ScanOptions,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            coords: dedup_coords(coords),
            strategy,
            selection,
            options,
            output_dir,
            config_json: "{}".to_string(),
        }
    }

    pub fn with_config_json(mut self, json: String) -> Self {
        self.config_json = json;
        self
    }
}

/// Drop exact repeats, keeping first occurrences in order.
pub fn dedup_coords(coords: impl IntoIterator<Item = SkyCoord>) -> Vec<SkyCoord> {
    let mut seen = HashSet::new();
    coords
        .into_iter()
        .filter(|c| seen.insert(c.bits()))
        .collect()
}

/// Result of one worker unit, handed to the collector.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub coord: SkyCoord,
    pub image_path: PathBuf,
    pub header: ImageHeader,
    pub wcs: Wcs,
    /// Objects found by extraction, before selection
    pub detected: usize,
    pub candidates: Vec<Candidate>,
}

/// Run the whole pipeline for a single coordinate.
///
/// Detection runs on the ring-filtered stack when the filter is on.
/// Selection sees the raw stack; photometry is measured on the
/// background-subtracted residual. Nothing here touches the store.
pub fn process_coordinate(
    repo: &dyn ImageRepository,
    coord: &SkyCoord,
    strategy: &dyn SelectionStrategy,
    options: &ScanOptions,
) -> Result<WorkerOutput, PipelineError> {
    let image = repo.resolve(coord)?;
    let ring = &options.ring_filter;
    let filtered;
    let detection_pixels = if ring.do_ring_filter {
        filtered = ring_filter(&image.data, ring.r_inner, ring.r_outer);
        &filtered
    } else {
        &image.data
    };
    let catalog =
        extract_catalog(detection_pixels, &options.extraction).map_err(|source| {
            PipelineError::Extraction {
                path: image.path.clone(),
                source,
            }
        })?;

    let mut accepted = strategy
        .select(&catalog.objects, &image.data)
        .collect_bounded();

    if options.photometry {
        photometry::refine(
            &mut accepted,
            &catalog.residual,
            image.header.zeropoint,
            &options.photometry_params,
        );
    }

    let candidates: Vec<Candidate> = accepted
        .into_iter()
        .map(|object| Candidate {
            coord: image.pix_to_sky(object.x, object.y),
            cutout: Cutout::from_object(&image.data, &object, options.cutout_padding),
            object,
        })
        .collect();

    tracing::debug!(
        "{} {}: {} objects, {} accepted by {}",
        coord,
        image.path.display(),
        catalog.len(),
        candidates.len(),
        strategy.name()
    );

    Ok(WorkerOutput {
        coord: *coord,
        image_path: image.path,
        header: image.header,
        wcs: image.wcs,
        detected: catalog.objects.len(),
        candidates,
    })
}

/// Sole writer of a run's output directory.
pub struct Collector {
    store: CatalogStore,
    next_id: u64,
    accepted: u64,
    cutout_failures: usize,
}

impl Collector {
    pub fn new(store: CatalogStore) -> Self {
        Self {
            store,
            next_id: 0,
            accepted: 0,
            cutout_failures: 0,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Stored candidates whose cutout file could not be written.
    pub fn cutout_failures(&self) -> usize {
        self.cutout_failures
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// Persist one worker's candidates in a single transaction, then write
    /// their cutouts. Returns the number of rows stored. A cutout that cannot
    /// be written is logged and counted; its row stays and the next cutout
    /// is attempted.
    pub fn collect(&mut self, output: WorkerOutput) -> Result<usize, StoreWriteError> {
        if output.candidates.is_empty() {
            return Ok(0);
        }

        let rows: Vec<StoredFinding> = output
            .candidates
            .iter()
            .zip(self.next_id..)
            .map(|(candidate, n)| StoredFinding {
                id: to_base36(n),
                hash: content_hash(&candidate.object.to_record_bytes()),
                ra: candidate.coord.ra,
                dec: candidate.coord.dec,
                object: candidate.object.clone(),
            })
            .collect();

        self.store.db().insert_findings(&rows)?;
        self.next_id += rows.len() as u64;
        self.accepted += rows.len() as u64;

        for (row, candidate) in rows.iter().zip(&output.candidates) {
            let path = cutout_path(self.store.dir(), &row.id);
            match image::write_cutout(&path, &candidate.cutout, &output.header, &output.wcs) {
                Ok(()) => tracing::info!(
                    "✨ Candidate {} at {} (npix {}, from {})",
                    row.id,
                    candidate.coord,
                    candidate.object.npix,
                    output.image_path.display()
                ),
                Err(e) => {
                    self.cutout_failures += 1;
                    tracing::error!(
                        "❌ Failed to write cutout {} for {}: {}",
                        path.display(),
                        candidate.coord,
                        e
                    );
                }
            }
        }
        Ok(rows.len())
    }
}

/// Counters reported at the end of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub scheduled: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub accepted: u64,
    pub cutout_failures: usize,
}

impl std::fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} candidates from {}/{} coordinates ({} skipped, {} timed out)",
            self.accepted, self.succeeded, self.scheduled, self.skipped, self.timed_out
        )?;
        if self.cutout_failures > 0 {
            write!(f, ", {} cutouts not written", self.cutout_failures)?;
        }
        Ok(())
    }
}

type UnitResult = (usize, SkyCoord, Result<WorkerOutput, PipelineError>);

/// Worker pool over an image repository with one selection strategy.
pub struct Scanner {
    repo: Arc<dyn ImageRepository>,
    strategy: Arc<dyn SelectionStrategy>,
    options: Arc<ScanOptions>,
}

impl Scanner {
    pub fn new(
        repo: Arc<dyn ImageRepository>,
        strategy: Arc<dyn SelectionStrategy>,
        options: ScanOptions,
    ) -> Self {
        Self {
            repo,
            strategy,
            options: Arc::new(options),
        }
    }

    /// Process `coords` (deduplicated, capped at `max_processed`) and feed
    /// every result to `collector` in completion order. A store failure
    /// aborts the scan; anything else only skips its coordinate.
    pub async fn run(
        &self,
        coords: &[SkyCoord],
        collector: &mut Collector,
    ) -> Result<ScanSummary, StoreWriteError> {
        let mut scheduled = dedup_coords(coords.iter().copied());
        if let Some(max) = self.options.max_processed {
            scheduled.truncate(max);
        }
        let total = scheduled.len();
        let mut summary = ScanSummary {
            scheduled: total,
            ..Default::default()
        };

        tracing::info!(
            "🚀 Scanning {} coordinates with {} workers ({})",
            total,
            self.options.processes,
            self.strategy.name()
        );

        let permits = Arc::new(Semaphore::new(self.options.processes.max(1)));
        let mut pending: JoinSet<UnitResult> = JoinSet::new();
        for (index, coord) in scheduled.into_iter().enumerate() {
            let permits = permits.clone();
            let repo = self.repo.clone();
            let strategy = self.strategy.clone();
            let options = self.options.clone();
            pending.spawn(async move {
                let permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let message = e.to_string();
                        return (index, coord, Err(PipelineError::WorkerPanic { coord, message }));
                    }
                };
                let timeout = options.task_timeout;
                let work = tokio::task::spawn_blocking(move || {
                    process_coordinate(repo.as_ref(), &coord, strategy.as_ref(), &options)
                });

                // The permit lives here, not in the blocking closure, so an
                // abandoned unit gives its slot back when the timeout fires.
                let joined = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            drop(permit);
                            return (index, coord, Err(PipelineError::Timeout { coord, timeout: limit }));
                        }
                    },
                    None => work.await,
                };
                drop(permit);
                let result = joined.unwrap_or_else(|e| {
                    Err(PipelineError::WorkerPanic {
                        coord,
                        message: e.to_string(),
                    })
                });
                (index, coord, result)
            });
        }

        while let Some(joined) = pending.join_next().await {
            let (index, coord, result) = match joined {
                Ok(unit) => unit,
                Err(e) => {
                    tracing::error!("❌ Scan task failed: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            };
            tracing::debug!("Finished {}/{}: {}", index + 1, total, coord);

            match result {
                Ok(output) => {
                    summary.succeeded += 1;
                    collector.collect(output)?;
                }
                Err(e @ PipelineError::Timeout { .. }) => {
                    summary.timed_out += 1;
                    tracing::warn!("⏱️  Skipping {}: {}", coord, e);
                }
                Err(e) => {
                    summary.skipped += 1;
                    tracing::warn!("⚠️  Skipping {}: {}", coord, e);
                }
            }
        }

        summary.accepted = collector.accepted();
        summary.cutout_failures = collector.cutout_failures();
        tracing::info!("🎯 Scan finished: {}", summary);
        Ok(summary)
    }
}

/// Create the output store, record the run, scan and close the run record.
pub async fn execute(
    repo: Arc<dyn ImageRepository>,
    run: &ScanRun,
) -> Result<ScanSummary, StoreWriteError> {
    let store = CatalogStore::create(&run.output_dir)?;
    let run_id = store.db().begin_run(run.strategy.as_str(), &run.config_json)?;
    tracing::info!("📁 Writing candidates to {}", run.output_dir.display());

    let strategy: Arc<dyn SelectionStrategy> = Arc::from(run.strategy.build(run.selection.clone()));
    let scanner = Scanner::new(repo, strategy, run.options.clone());
    let mut collector = Collector::new(store);
    let summary = scanner.run(&run.coords, &mut collector).await?;

    collector.store().db().finish_run(run_id, summary.accepted)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CatalogReader;
    use crate::error::ImageResolutionError;
    use crate::image::SurveyImage;
    use crate::models::{test_object, DetectedObject};
    use crate::selection::Findings;
    use nalgebra::{DMatrix, Matrix2};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn header() -> ImageHeader {
        ImageHeader {
            zeropoint: 25.0,
            sb_sig: Some(3.0),
            width: 64,
            height: 64,
        }
    }

    fn wcs() -> Wcs {
        let scale = 8.0 / 3600.0;
        Wcs::new((31.5, 31.5), (150.0, 2.0), Matrix2::new(-scale, 0.0, 0.0, scale)).unwrap()
    }

    fn output(n: usize) -> WorkerOutput {
        let data = DMatrix::from_fn(64, 64, |r, c| (r + c) as f64);
        let candidates = (0..n)
            .map(|i| {
                let object = test_object(10.0 + i as f64 * 5.0, 20.0, 40, 400.0);
                Candidate {
                    coord: wcs().pix_to_sky(object.x, object.y),
                    cutout: Cutout::from_object(&data, &object, 2),
                    object,
                }
            })
            .collect();
        WorkerOutput {
            coord: SkyCoord::new(150.0, 2.0),
            image_path: PathBuf::from("F1000+02_a.fits"),
            header: header(),
            wcs: wcs(),
            detected: n,
            candidates,
        }
    }

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let a = SkyCoord::new(1.0, 2.0);
        let b = SkyCoord::new(3.0, 4.0);
        let c = SkyCoord::new(5.0, 6.0);
        assert_eq!(dedup_coords([a, b, a, c, b]), vec![a, b, c]);
    }

    #[test]
    fn test_collector_assigns_sequential_ids_and_writes_cutouts() {
        let temp = TempDir::new().unwrap();
        let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());

        assert_eq!(collector.collect(output(3)).unwrap(), 3);
        assert_eq!(collector.collect(output(0)).unwrap(), 0);
        assert_eq!(collector.collect(output(2)).unwrap(), 2);
        assert_eq!(collector.accepted(), 5);

        let reader = CatalogReader::open(temp.path()).unwrap();
        let ids: Vec<String> = reader.load().unwrap().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);

        let cutout = reader.get_cutout(4).unwrap();
        assert_eq!(cutout, output(2).candidates[1].cutout);
    }

    #[test]
    fn test_cutout_failure_does_not_lose_rows() {
        let temp = TempDir::new().unwrap();
        let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());
        // A directory where the cutout file should go makes the write fail
        std::fs::create_dir(cutout_path(temp.path(), "0")).unwrap();

        assert_eq!(collector.collect(output(2)).unwrap(), 2);
        assert_eq!(collector.cutout_failures(), 1);
        assert_eq!(collector.accepted(), 2);
        let reader = CatalogReader::open(temp.path()).unwrap();
        assert_eq!(reader.load().unwrap().len(), 2);
        assert!(reader.get_cutout(1).is_ok());
    }

    #[test]
    fn test_summary_display() {
        let summary = ScanSummary {
            scheduled: 4,
            succeeded: 2,
            skipped: 1,
            timed_out: 1,
            accepted: 3,
            cutout_failures: 0,
        };
        assert_eq!(
            summary.to_string(),
            "3 candidates from 2/4 coordinates (1 skipped, 1 timed out)"
        );
        let partial = ScanSummary {
            cutout_failures: 2,
            ..summary
        };
        assert_eq!(
            partial.to_string(),
            "3 candidates from 2/4 coordinates (1 skipped, 1 timed out), 2 cutouts not written"
        );
    }

    struct Blank {
        resolved: AtomicUsize,
    }

    impl ImageRepository for Blank {
        fn resolve(&self, coord: &SkyCoord) -> Result<SurveyImage, ImageResolutionError> {
            self.resolved.fetch_add(1, Ordering::SeqCst);
            if coord.dec < 0.0 {
                return Err(ImageResolutionError::NoMatch { coord: *coord });
            }
            Ok(SurveyImage {
                path: PathBuf::from("blank.fits"),
                data: DMatrix::from_element(64, 64, f64::NAN),
                header: header(),
                wcs: wcs(),
            })
        }

        fn unique_coords(&self) -> Vec<SkyCoord> {
            Vec::new()
        }
    }

    struct Nothing;

    impl SelectionStrategy for Nothing {
        fn name(&self) -> &'static str {
            "nothing"
        }

        fn select<'a>(&'a self, _objects: &'a [DetectedObject], _pixels: &'a DMatrix<f64>) -> Findings<'a> {
            Findings::empty()
        }
    }

    #[tokio::test]
    async fn test_failures_are_skipped_not_fatal() {
        let temp = TempDir::new().unwrap();
        let repo = Arc::new(Blank {
            resolved: AtomicUsize::new(0),
        });
        let scanner = Scanner::new(repo.clone(), Arc::new(Nothing), ScanOptions::default());
        let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());

        // Negative declinations fail to resolve, the rest have no finite pixels
        let coords = [
            SkyCoord::new(1.0, 1.0),
            SkyCoord::new(2.0, -1.0),
            SkyCoord::new(1.0, 1.0),
            SkyCoord::new(3.0, 2.0),
        ];
        let summary = scanner.run(&coords, &mut collector).await.unwrap();
        assert_eq!(summary.scheduled, 3);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.accepted, 0);
        assert_eq!(repo.resolved.load(Ordering::SeqCst), 3);
    }
}
