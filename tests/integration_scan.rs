use lbg_scan::butler::{Butler, ImageRepository};
use lbg_scan::db::{CatalogReader, CatalogStore};
use lbg_scan::error::{ImageResolutionError, StoreWriteError};
use lbg_scan::image::{write_image, ImageHeader, SurveyImage, SB_SIG_CARD, ZEROPOINT_CARD};
use lbg_scan::models::{DetectedObject, SkyCoord};
use lbg_scan::ring_filter::RingFilterParams;
use lbg_scan::scanner::{self, Collector, ScanOptions, ScanRun, Scanner};
use lbg_scan::selection::{Findings, SelectionConfig, SelectionStrategy, StrategyKind};
use lbg_scan::utils::{content_hash, from_base36};
use lbg_scan::wcs::Wcs;
use nalgebra::{DMatrix, Matrix2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ---- Test Harness ----

const SIZE: usize = 128;

fn sky_wcs(coord: &SkyCoord) -> Wcs {
    let scale = 8.0 / 3600.0;
    let centre = (SIZE as f64 - 1.0) / 2.0;
    Wcs::new((centre, centre), (coord.ra, coord.dec), Matrix2::new(-scale, 0.0, 0.0, scale)).unwrap()
}

fn add_gaussian(data: &mut DMatrix<f64>, x: f64, y: f64, sigma: f64, amplitude: f64) {
    let (rows, cols) = data.shape();
    for r in 0..rows {
        for c in 0..cols {
            let d2 = (c as f64 - x).powi(2) + (r as f64 - y).powi(2);
            data[(r, c)] += amplitude * (-d2 / (2.0 * sigma * sigma)).exp();
        }
    }
}

/// Flat noisy sky with three bright sources.
fn synthetic_stack(seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = DMatrix::from_fn(SIZE, SIZE, |_, _| 100.0 + (rng.random::<f64>() - 0.5) * 2.0);
    add_gaussian(&mut data, 30.0, 30.0, 2.0, 400.0);
    add_gaussian(&mut data, 62.0, 48.0, 3.0, 300.0);
    add_gaussian(&mut data, 40.0, 70.0, 2.5, 350.0);
    data
}

/// In-memory repository. Negative declinations do not resolve, dec 89 has no
/// finite pixels, and RA at or above 300 takes two seconds to load.
struct SyntheticSky {
    resolved: AtomicUsize,
}

impl SyntheticSky {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            resolved: AtomicUsize::new(0),
        })
    }
}

impl ImageRepository for SyntheticSky {
    fn resolve(&self, coord: &SkyCoord) -> Result<SurveyImage, ImageResolutionError> {
        self.resolved.fetch_add(1, Ordering::SeqCst);
        if coord.dec < 0.0 {
            return Err(ImageResolutionError::NoMatch { coord: *coord });
        }
        if coord.ra >= 300.0 {
            std::thread::sleep(Duration::from_secs(2));
        }
        let data = if coord.dec == 89.0 {
            DMatrix::from_element(SIZE, SIZE, f64::NAN)
        } else {
            synthetic_stack(coord.ra.to_bits())
        };
        Ok(SurveyImage {
            path: PathBuf::from(format!("synthetic-{}.fits", coord.ra)),
            data,
            header: ImageHeader {
                zeropoint: 27.0,
                sb_sig: Some(1.0),
                width: SIZE,
                height: SIZE,
            },
            wcs: sky_wcs(coord),
        })
    }

    fn unique_coords(&self) -> Vec<SkyCoord> {
        Vec::new()
    }
}

/// Accepts every object with a sizeable footprint.
struct LargeObjects;

impl SelectionStrategy for LargeObjects {
    fn name(&self) -> &'static str {
        "large-objects"
    }

    fn select<'a>(&'a self, objects: &'a [DetectedObject], _pixels: &'a DMatrix<f64>) -> Findings<'a> {
        Findings::new(objects.iter().filter(|o| o.npix >= 12), 2)
    }
}

fn coords(n: usize) -> Vec<SkyCoord> {
    (0..n).map(|i| SkyCoord::new(10.0 + i as f64, 5.0)).collect()
}

/// Scan options for the compact synthetic sources, which the ring filter
/// would erase.
fn compact_options() -> ScanOptions {
    ScanOptions {
        ring_filter: RingFilterParams {
            do_ring_filter: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pool(repo: Arc<SyntheticSky>, options: ScanOptions) -> Scanner {
    Scanner::new(repo, Arc::new(LargeObjects), options)
}

// ---- Tests ----

#[tokio::test]
async fn test_max_processed_caps_the_scan() {
    let temp = TempDir::new().unwrap();
    let repo = SyntheticSky::new();
    let options = ScanOptions {
        max_processed: Some(5),
        photometry: false,
        ..compact_options()
    };
    let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());

    let summary = pool(repo.clone(), options)
        .run(&coords(20), &mut collector)
        .await
        .unwrap();

    assert_eq!(summary.scheduled, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(repo.resolved.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identifiers_are_dense_across_concurrent_workers() {
    let temp = TempDir::new().unwrap();
    let options = ScanOptions {
        processes: 4,
        cutout_padding: 3,
        ..compact_options()
    };
    let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());
    let summary = pool(SyntheticSky::new(), options)
        .run(&coords(12), &mut collector)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 12);
    assert!(summary.accepted >= 12, "every image holds bright sources");

    let reader = CatalogReader::open(temp.path()).unwrap();
    let findings = reader.load().unwrap();
    assert_eq!(findings.len() as u64, summary.accepted);

    let mut ids: Vec<u64> = findings.iter().map(|f| from_base36(&f.id).unwrap()).collect();
    ids.sort_unstable();
    let expected: Vec<u64> = (0..summary.accepted).collect();
    assert_eq!(ids, expected);

    for finding in &findings {
        assert_eq!(finding.hash, content_hash(&finding.object.to_record_bytes()));
        assert!(finding.object.auto.is_some(), "photometry is on by default");

        let cutout = reader.get_cutout_by_name(&finding.id.to_lowercase()).unwrap();
        let obj = &finding.object;
        assert!(cutout.x0 as i64 <= obj.xmin && cutout.y0 as i64 <= obj.ymin);
        let (w, h) = cutout.dimensions();
        assert!((cutout.x0 + w) as i64 > obj.xmax);
        assert!((cutout.y0 + h) as i64 > obj.ymax);
    }
}

#[tokio::test]
async fn test_failing_coordinates_are_skipped() {
    let temp = TempDir::new().unwrap();
    let repo = SyntheticSky::new();
    let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());

    let input = vec![
        SkyCoord::new(10.0, 5.0),
        SkyCoord::new(11.0, -5.0),
        SkyCoord::new(12.0, 89.0),
        SkyCoord::new(13.0, 5.0),
        SkyCoord::new(10.0, 5.0),
    ];
    let summary = pool(repo.clone(), compact_options())
        .run(&input, &mut collector)
        .await
        .unwrap();

    assert_eq!(summary.scheduled, 4);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.timed_out, 0);
    assert_eq!(repo.resolved.load(Ordering::SeqCst), 4);

    let reader = CatalogReader::open(temp.path()).unwrap();
    assert_eq!(reader.load().unwrap().len() as u64, summary.accepted);
}

#[tokio::test]
async fn test_slow_coordinate_times_out() {
    let temp = TempDir::new().unwrap();
    let options = ScanOptions {
        processes: 2,
        task_timeout: Some(Duration::from_millis(500)),
        photometry: false,
        ..compact_options()
    };
    let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());
    let input = vec![SkyCoord::new(10.0, 5.0), SkyCoord::new(300.0, 5.0)];

    let summary = pool(SyntheticSky::new(), options)
        .run(&input, &mut collector)
        .await
        .unwrap();

    assert_eq!(summary.scheduled, 2);
    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 0);
}

#[tokio::test]
async fn test_timed_out_unit_frees_its_worker() {
    let temp = TempDir::new().unwrap();
    let options = ScanOptions {
        processes: 1,
        task_timeout: Some(Duration::from_millis(300)),
        photometry: false,
        ..compact_options()
    };
    let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());
    // The slow field is scheduled first and would hold the only worker for two seconds
    let input = vec![
        SkyCoord::new(300.0, 5.0),
        SkyCoord::new(10.0, 5.0),
        SkyCoord::new(11.0, 5.0),
    ];

    let started = Instant::now();
    let summary = pool(SyntheticSky::new(), options)
        .run(&input, &mut collector)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.succeeded, 2);
    assert!(
        elapsed < Duration::from_millis(1900),
        "remaining fields waited for the abandoned one: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_unwritable_cutout_does_not_stop_the_scan() {
    let temp = TempDir::new().unwrap();
    // A directory squats on the first cutout's file name
    std::fs::create_dir(temp.path().join("0.fits")).unwrap();
    let options = ScanOptions {
        processes: 1,
        photometry: false,
        ..compact_options()
    };
    let mut collector = Collector::new(CatalogStore::create(temp.path()).unwrap());

    let summary = pool(SyntheticSky::new(), options)
        .run(&coords(3), &mut collector)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.cutout_failures, 1);
    assert!(summary.to_string().ends_with("1 cutouts not written"));

    let reader = CatalogReader::open(temp.path()).unwrap();
    let findings = reader.load().unwrap();
    assert_eq!(findings.len() as u64, summary.accepted);
    assert!(summary.accepted > 1);
    for finding in findings.iter().filter(|f| f.id != "0") {
        assert!(reader.get_cutout_by_name(&finding.id).is_ok());
    }
}

fn write_stack(dir: &std::path::Path, name: &str, sb_sig: f64, seed: u64) {
    let field = lbg_scan::butler::parse_field_name(name).unwrap();
    let mut cards = sky_wcs(&field).to_cards();
    cards.push((ZEROPOINT_CARD, 27.0));
    cards.push((SB_SIG_CARD, sb_sig));
    write_image(&dir.join(name), &synthetic_stack(seed), &cards).unwrap();
}

#[tokio::test]
async fn test_scan_over_stack_directory() {
    let stacks = TempDir::new().unwrap();
    write_stack(stacks.path(), "F0100+10_a.fits", 2.0, 1);
    write_stack(stacks.path(), "F0200+10_a.fits", 1.0, 2);
    write_stack(stacks.path(), "F0200+10_b.fits", 5.0, 3);
    let butler = Butler::open(stacks.path()).unwrap();
    let field_coords = butler.unique_coords();
    assert_eq!(field_coords.len(), 2);

    let out = TempDir::new().unwrap();
    let output_dir = out.path().join("out0");
    let selection = SelectionConfig {
        skip_corner_filter: true,
        ..Default::default()
    };
    let run = ScanRun::new(
        field_coords,
        StrategyKind::ProfileShape,
        selection,
        ScanOptions::default(),
        output_dir.clone(),
    )
    .with_config_json("{\"test\":true}".to_string());

    let repo: Arc<dyn ImageRepository> = Arc::new(butler);
    let summary = scanner::execute(repo.clone(), &run).await.unwrap();
    assert_eq!(summary.scheduled, 2);
    assert_eq!(summary.succeeded, 2);

    let reader = CatalogReader::open(&output_dir).unwrap();
    let findings = reader.load().unwrap();
    assert_eq!(findings.len() as u64, summary.accepted);
    for finding in &findings {
        assert!(reader.get_cutout_by_name(&finding.id).is_ok());
    }

    let record = reader.latest_run().unwrap().unwrap();
    assert_eq!(record.strategy, "profile-shape");
    assert_eq!(record.config, "{\"test\":true}");
    assert_eq!(record.accepted, Some(summary.accepted as i64));
    assert!(record.finished_at.is_some());

    // A finished run directory is never appended to
    match scanner::execute(repo, &run).await {
        Err(StoreWriteError::AlreadyExists(_)) => {}
        other => panic!("unexpected {other:?}"),
    }
}
