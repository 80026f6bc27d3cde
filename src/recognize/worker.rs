//! Recognition worker loop
//!
//! Each worker independently scans the queue directory, claims one file at a
//! time, runs the engine on it, classifies the result and routes the file by
//! outcome. Workers coordinate only through the lock protocol and the result
//! sink; there is no in-process queue between them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::geotag::{self, CaptureMetadata};
use crate::queue::{self, WorkQueue};
use crate::sink::{MatchRecord, ResultSink, Router};

use super::classify::{classify, AcceptedPlate, Thresholds};
use super::PlateEngine;

const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct RecognizerWorker {
    id: usize,
    owner: String,
    queue: Arc<dyn WorkQueue>,
    engine: Arc<dyn PlateEngine>,
    thresholds: Thresholds,
    sink: Arc<ResultSink>,
    router: Router,
    scan_interval: Duration,
    running: Arc<AtomicBool>,
}

impl RecognizerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queue: Arc<dyn WorkQueue>,
        engine: Arc<dyn PlateEngine>,
        thresholds: Thresholds,
        sink: Arc<ResultSink>,
        router: Router,
        scan_interval: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            owner: format!("{}:worker-{id}", std::process::id()),
            queue,
            engine,
            thresholds,
            sink,
            router,
            scan_interval,
            running,
        }
    }

    pub fn run(self) {
        info!("recognizer worker {} running", self.id);
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(self.scan_interval);
            if let Err(err) = self.scan_once() {
                warn!("worker {}: scan failed: {err:#}", self.id);
            }
        }
        info!("recognizer worker {} stopped", self.id);
    }

    /// One pass over the queue listing. Factored out of [`run`](Self::run) so
    /// tests can drive the loop deterministically.
    pub fn scan_once(&self) -> Result<()> {
        for name in self.queue.list()? {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if !queue::is_image_name(&name) {
                if !queue::is_sentinel_name(&name) {
                    warn!("ignoring file with unrecognized name {name}");
                }
                continue;
            }
            if !self.queue.claim(&name, &self.owner)? {
                continue;
            }
            if let Err(err) = self.process(&name) {
                error!("worker {}: processing {name} failed: {err:#}", self.id);
            }
        }
        Ok(())
    }

    /// Recognize, classify, record and route one claimed file. The claim is
    /// dropped as soon as the engine call returns; it only guards the claim
    /// race, not the processing.
    fn process(&self, name: &str) -> Result<()> {
        let path = self.queue.path_of(name);
        let started_at = Local::now();
        let started = Instant::now();
        let result = self.engine.recognize(&path);
        let recognize_secs = started.elapsed().as_secs_f64();
        self.queue.release(name);

        // An engine failure leaves the file queued; a later scan retries it.
        let regions = result?;
        info!(
            "recognized {} in {recognize_secs:.4}s, {} possible plate(s)",
            path.display(),
            regions.len()
        );

        let (accepted, outcome) = classify(&regions, &self.thresholds);
        if !accepted.is_empty() {
            let records = self.build_records(name, &path, &accepted, started_at, recognize_secs);
            self.sink.record(name, &records)?;
        }
        let routed = self.router.route(&path, name, outcome)?;
        debug!("{name}: {outcome:?} -> {routed:?}");
        Ok(())
    }

    fn build_records(
        &self,
        name: &str,
        path: &Path,
        accepted: &[AcceptedPlate],
        started_at: DateTime<Local>,
        recognize_secs: f64,
    ) -> Vec<MatchRecord> {
        // Embedded tags are read once per image regardless of match count.
        let meta = match geotag::read_metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("no usable metadata in {name}: {err:#}");
                CaptureMetadata::default()
            }
        };
        let (capture_time, capture_epoch_time) = match meta.capture_time {
            Some(time) => (
                time.format(RECORD_TIME_FORMAT).to_string(),
                time.and_local_timezone(Local)
                    .earliest()
                    .map(|local| local.timestamp())
                    .unwrap_or(0),
            ),
            None => (String::new(), 0),
        };

        accepted
            .iter()
            .map(|plate| MatchRecord {
                recognize_time: started_at.format(RECORD_TIME_FORMAT).to_string(),
                recognize_epoch_time: started_at.timestamp(),
                plate: plate.plate.clone(),
                confidence: plate.confidence,
                matches_template: plate.matches_template,
                file: name.to_string(),
                recognize_secs,
                capture_time: capture_time.clone(),
                capture_epoch_time,
                capture_latitude: meta.latitude,
                capture_longitude: meta.longitude,
                capture_altitude_m: meta.altitude_m,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DirQueue;
    use crate::recognize::{PlateCandidate, PlateRegion};
    use std::fs;
    use std::path::PathBuf;

    struct ScriptedEngine(Vec<PlateRegion>);

    impl PlateEngine for ScriptedEngine {
        fn recognize(&self, _image: &Path) -> Result<Vec<PlateRegion>> {
            Ok(self.0.clone())
        }
    }

    struct FailingEngine;

    impl PlateEngine for FailingEngine {
        fn recognize(&self, _image: &Path) -> Result<Vec<PlateRegion>> {
            anyhow::bail!("engine crashed")
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        hit: PathBuf,
        lowconf: PathBuf,
        csv: PathBuf,
        snapshots: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let hit = dir.path().join("hit");
            let lowconf = dir.path().join("lowconf");
            let snapshots = dir.path().join("json");
            for d in [&hit, &lowconf, &snapshots] {
                fs::create_dir(d).expect("mkdir");
            }
            Self {
                csv: dir.path().join("output.csv"),
                dir,
                hit,
                lowconf,
                snapshots,
            }
        }

        fn queue_dir(&self) -> PathBuf {
            let queue = self.dir.path().join("capture");
            if !queue.exists() {
                fs::create_dir(&queue).expect("mkdir");
            }
            queue
        }

        fn enqueue(&self, name: &str) {
            fs::write(self.queue_dir().join(name), b"not really a jpeg").expect("write");
        }

        fn worker(&self, engine: Arc<dyn PlateEngine>) -> RecognizerWorker {
            let queue = Arc::new(DirQueue::new(self.queue_dir(), Duration::from_secs(120)));
            let sink = Arc::new(
                ResultSink::new(Some(self.csv.clone()), Some(self.snapshots.clone()))
                    .expect("sink"),
            );
            let router = Router::new(self.hit.clone(), Some(self.lowconf.clone()), None);
            RecognizerWorker::new(
                0,
                queue,
                engine,
                Thresholds::default(),
                sink,
                router,
                Duration::from_millis(1),
                Arc::new(AtomicBool::new(true)),
            )
        }
    }

    fn hit_region(plate: &str, confidence: f64) -> PlateRegion {
        PlateRegion {
            candidates: vec![PlateCandidate {
                plate: plate.to_string(),
                confidence,
                matches_template: true,
            }],
        }
    }

    #[test]
    fn hit_is_recorded_and_routed() {
        let fixture = Fixture::new();
        fixture.enqueue("1700000000000-1.jpg");
        let worker = fixture.worker(Arc::new(ScriptedEngine(vec![hit_region("ABC123", 91.2)])));

        worker.scan_once().expect("scan");

        assert!(fixture.hit.join("1700000000000-1.jpg").exists());
        assert!(!fixture.queue_dir().join("1700000000000-1.jpg").exists());
        // No EXIF in the fake image, so enrichment degrades to zeros.
        let csv = fs::read_to_string(&fixture.csv).expect("csv");
        let row = csv.lines().nth(1).expect("row");
        assert!(row.contains("ABC123"));
        assert!(row.contains(",91.20,"));
        assert!(row.contains(",0.0000000,"));
        assert!(fixture.snapshots.join("1700000000000-1.json").exists());
    }

    #[test]
    fn low_confidence_routes_without_records() {
        let fixture = Fixture::new();
        fixture.enqueue("1700000000000-2.jpg");
        let worker = fixture.worker(Arc::new(ScriptedEngine(vec![hit_region("ABC123", 40.0)])));

        worker.scan_once().expect("scan");

        assert!(fixture.lowconf.join("1700000000000-2.jpg").exists());
        assert!(!fixture.csv.exists());
        assert!(!fixture.snapshots.join("1700000000000-2.json").exists());
    }

    #[test]
    fn no_hit_without_directory_deletes_the_image() {
        let fixture = Fixture::new();
        fixture.enqueue("1700000000000-3.jpg");
        let worker = fixture.worker(Arc::new(ScriptedEngine(vec![])));

        worker.scan_once().expect("scan");

        assert!(!fixture.queue_dir().join("1700000000000-3.jpg").exists());
        assert!(!fixture.hit.join("1700000000000-3.jpg").exists());
        assert!(!fixture.csv.exists());
    }

    #[test]
    fn engine_failure_leaves_the_file_queued_and_unlocked() {
        let fixture = Fixture::new();
        fixture.enqueue("1700000000000-4.jpg");
        let worker = fixture.worker(Arc::new(FailingEngine));

        worker.scan_once().expect("scan");

        let queued = fixture.queue_dir().join("1700000000000-4.jpg");
        assert!(queued.exists());
        assert!(!fixture
            .queue_dir()
            .join("1700000000000-4.jpg.lock")
            .exists());
    }

    #[test]
    fn foreign_names_are_left_alone() {
        let fixture = Fixture::new();
        fixture.enqueue("README");
        fixture.enqueue("notes.txt");
        fixture.enqueue(".tmp.1700000000000-5.jpg");
        let worker = fixture.worker(Arc::new(ScriptedEngine(vec![hit_region("ABC123", 91.2)])));

        worker.scan_once().expect("scan");

        assert!(fixture.queue_dir().join("README").exists());
        assert!(fixture.queue_dir().join("notes.txt").exists());
        assert!(fixture.queue_dir().join(".tmp.1700000000000-5.jpg").exists());
        assert!(!fixture.csv.exists());
    }

    #[test]
    fn files_process_in_capture_order() {
        let fixture = Fixture::new();
        fixture.enqueue("1700000000200-1.jpg");
        fixture.enqueue("1700000000100-1.jpg");
        let worker = fixture.worker(Arc::new(ScriptedEngine(vec![hit_region("ABC123", 91.2)])));

        worker.scan_once().expect("scan");

        let csv = fs::read_to_string(&fixture.csv).expect("csv");
        let rows: Vec<&str> = csv.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains("1700000000100-1.jpg"));
        assert!(rows[1].contains("1700000000200-1.jpg"));
    }
}
