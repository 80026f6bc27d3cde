//! Pipeline coordinator
//!
//! Wires the capture controller and the recognition worker pool together over
//! one shared cancellation flag. There is no scheduler and no in-process
//! queue: the capture directory is the only coupling between producer and
//! consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::info;

use crate::capture::camera::Camera;
use crate::capture::{CaptureConfig, CaptureWorker};
use crate::config::AppConfig;
use crate::position::PositionSource;
use crate::queue::{DirQueue, WorkQueue};
use crate::recognize::{PlateEngine, RecognizerWorker};
use crate::sink::{ResultSink, Router};

/// Running pipeline: one capture thread plus N recognition workers.
pub struct Pipeline {
    running: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Validate the layout, then spawn every thread. The camera, position
    /// source and engine are constructed by the caller so their startup
    /// failures surface before anything runs.
    pub fn start(
        config: &AppConfig,
        camera: Box<dyn Camera>,
        position: Arc<dyn PositionSource>,
        engine: Arc<dyn PlateEngine>,
    ) -> Result<Self> {
        config
            .paths
            .ensure_dirs()
            .context("creating working directories")?;
        let sink = Arc::new(ResultSink::new(
            config.paths.csv_log.clone(),
            config.paths.snapshot_dir.clone(),
        )?);
        let router = Router::new(
            config.paths.hit_dir.clone(),
            config.paths.low_confidence_dir.clone(),
            config.paths.no_hit_dir.clone(),
        );
        let queue: Arc<dyn WorkQueue> = Arc::new(DirQueue::new(
            &config.paths.capture_dir,
            config.recognizer.stale_lock_age(),
        ));
        let running = Arc::new(AtomicBool::new(true));

        let capture_worker = CaptureWorker::new(
            camera,
            position,
            CaptureConfig::from_app_config(config),
            Arc::clone(&running),
        );
        let capture = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || capture_worker.run())?;

        let mut workers = Vec::with_capacity(config.recognizer.workers);
        for id in 0..config.recognizer.workers {
            let worker = RecognizerWorker::new(
                id,
                Arc::clone(&queue),
                Arc::clone(&engine),
                config.recognizer.thresholds(),
                Arc::clone(&sink),
                router.clone(),
                config.recognizer.scan_interval(),
                Arc::clone(&running),
            );
            workers.push(
                std::thread::Builder::new()
                    .name(format!("recognizer-{id}"))
                    .spawn(move || worker.run())?,
            );
        }

        info!(
            "pipeline running: 1 capture thread, {} recognizer worker(s)",
            config.recognizer.workers
        );
        Ok(Self {
            running,
            capture: Some(capture),
            workers,
        })
    }

    /// Shared cancellation flag; clearing it stops every thread.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Cooperative shutdown: flip the flag and wait for in-flight work to
    /// finish. In-flight recognition completes; nothing is interrupted.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::SyntheticCamera;
    use crate::config::{CameraKind, CaptureSettings, PathsConfig, RecognizerSettings};
    use crate::position::Fix;
    use crate::recognize::{PlateCandidate, PlateRegion};
    use chrono::Utc;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, Instant};

    struct FixedSource;

    impl PositionSource for FixedSource {
        fn latest_fix(&self) -> Option<Fix> {
            Some(Fix {
                latitude: -42.1234567,
                longitude: 18.7654321,
                altitude: Some(132.5),
                speed: Some(10.0),
                time: Utc::now(),
            })
        }
    }

    struct ScriptedEngine(Vec<PlateRegion>);

    impl PlateEngine for ScriptedEngine {
        fn recognize(&self, _image: &Path) -> Result<Vec<PlateRegion>> {
            Ok(self.0.clone())
        }
    }

    fn test_config(root: &Path) -> AppConfig {
        AppConfig {
            paths: PathsConfig {
                capture_dir: root.join("capture"),
                gate_file: Some(root.join("capture_ctl")),
                hit_dir: root.join("proc-hit"),
                low_confidence_dir: Some(root.join("proc-lowconf")),
                no_hit_dir: None,
                snapshot_dir: Some(root.join("json")),
                csv_log: Some(root.join("output.csv")),
            },
            capture: CaptureSettings {
                camera: CameraKind::Synthetic,
                width: 64,
                height: 48,
                poll_interval_ms: 10,
                max_files: Some(100),
                ..CaptureSettings::default()
            },
            recognizer: RecognizerSettings {
                workers: 2,
                scan_interval_ms: 10,
                ..RecognizerSettings::default()
            },
            ..AppConfig::default()
        }
    }

    fn wait_for(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        predicate()
    }

    #[test]
    fn end_to_end_hit_flows_from_capture_to_csv_and_hit_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        // Gate open from the start.
        fs::create_dir_all(dir.path()).expect("root");
        fs::write(dir.path().join("capture_ctl"), b"").expect("gate");

        let engine = ScriptedEngine(vec![PlateRegion {
            candidates: vec![PlateCandidate {
                plate: "ABC123".to_string(),
                confidence: 91.2,
                matches_template: true,
            }],
        }]);
        let mut pipeline = Pipeline::start(
            &config,
            Box::new(SyntheticCamera::new(64, 48, 85)),
            Arc::new(FixedSource),
            Arc::new(engine),
        )
        .expect("pipeline");

        let hit_dir = config.paths.hit_dir.clone();
        let csv_path = config.paths.csv_log.clone().expect("csv path");
        let done = wait_for(Duration::from_secs(20), || {
            csv_path.exists()
                && fs::read_dir(&hit_dir).map(|entries| entries.count() > 0).unwrap_or(false)
        });
        pipeline.stop();
        assert!(done, "no hit flowed through the pipeline in time");

        let csv = fs::read_to_string(&csv_path).expect("csv");
        let mut lines = csv.lines();
        let header = lines.next().expect("header");
        assert!(header.starts_with("recognize_time,recognize_epoch_time,plate,confidence"));
        assert!(header.ends_with("capture_latitude,capture_longitude,capture_altitude_m"));

        let row = lines.next().expect("row");
        assert!(row.contains(",ABC123,"));
        assert!(row.contains(",91.20,"));
        assert!(row.contains(",true,"));
        assert!(row.contains(",-42.1234567,"));
        // The longitude encoding is only exact to the seconds resolution.
        assert!(row.contains(",18.76543"));

        // One snapshot per routed image, named after its source.
        let routed: Vec<String> = fs::read_dir(&hit_dir)
            .expect("hit dir")
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        assert!(!routed.is_empty());
        let stem = routed[0].strip_suffix(".jpg").expect("jpg suffix");
        assert!(config
            .paths
            .snapshot_dir
            .as_ref()
            .expect("snapshot dir")
            .join(format!("{stem}.json"))
            .exists());

        // Shutdown left no lock sentinels behind.
        let leftover_locks = fs::read_dir(&config.paths.capture_dir)
            .expect("capture dir")
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".lock"))
            .count();
        assert_eq!(leftover_locks, 0);
    }

    #[test]
    fn low_confidence_images_produce_no_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        fs::create_dir_all(dir.path()).expect("root");
        fs::write(dir.path().join("capture_ctl"), b"").expect("gate");

        let engine = ScriptedEngine(vec![PlateRegion {
            candidates: vec![PlateCandidate {
                plate: "ABC123".to_string(),
                confidence: 40.0,
                matches_template: true,
            }],
        }]);
        let mut pipeline = Pipeline::start(
            &config,
            Box::new(SyntheticCamera::new(64, 48, 85)),
            Arc::new(FixedSource),
            Arc::new(engine),
        )
        .expect("pipeline");

        let lowconf_dir = config.paths.low_confidence_dir.clone().expect("lowconf");
        let routed = wait_for(Duration::from_secs(20), || {
            fs::read_dir(&lowconf_dir).map(|entries| entries.count() > 0).unwrap_or(false)
        });
        pipeline.stop();
        assert!(routed, "no low-confidence image was routed in time");

        assert!(!config.paths.csv_log.as_ref().expect("csv path").exists());
        let snapshots = fs::read_dir(config.paths.snapshot_dir.as_ref().expect("snapshots"))
            .expect("snapshot dir")
            .count();
        assert_eq!(snapshots, 0);
    }
}
