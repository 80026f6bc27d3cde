//! Capture Controller
//!
//! The single producer: polls backpressure and the gating file, pulls a fix
//! from the position source, invokes the camera and publishes the result into
//! the queue directory. Publication is temp-name-then-atomic-rename, so a
//! capture is never visible to workers under its final name until complete.

pub mod camera;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use tracing::{debug, info, warn};

use crate::position::{Fix, PositionSource};
use crate::queue::TMP_PREFIX;
use camera::Camera;

/// Escalating sleep applied while the queue directory sits at its ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 1.25,
        }
    }
}

impl BackoffPolicy {
    /// Next sleep after `last`; `None` means the first over-ceiling cycle.
    pub fn next(&self, last: Option<Duration>) -> Duration {
        match last {
            None => self.initial,
            Some(last) => self.max.min(last.mul_f64(self.factor)),
        }
    }
}

/// Runtime configuration for the capture loop.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub target_dir: PathBuf,
    /// When set, capture only while this file exists.
    pub gate_file: Option<PathBuf>,
    /// Base sleep between capture cycles.
    pub poll_interval: Duration,
    /// Sleep while the gate file is absent.
    pub gate_poll: Duration,
    /// File-count ceiling for the queue directory (None = unlimited).
    pub max_files: Option<usize>,
    /// Oldest acceptable position fix.
    pub gps_max_age: Duration,
    pub backoff: BackoffPolicy,
}

impl CaptureConfig {
    pub fn from_app_config(config: &crate::config::AppConfig) -> Self {
        let capture = &config.capture;
        Self {
            target_dir: config.paths.capture_dir.clone(),
            gate_file: config.paths.gate_file.clone(),
            poll_interval: Duration::from_millis(capture.poll_interval_ms),
            gate_poll: Duration::from_secs(capture.gate_poll_secs),
            max_files: capture.max_files,
            gps_max_age: Duration::from_secs(capture.gps_max_age_secs),
            backoff: BackoffPolicy {
                initial: Duration::from_secs_f64(capture.backoff_initial_secs),
                max: Duration::from_secs_f64(capture.backoff_max_secs),
                factor: capture.backoff_factor,
            },
        }
    }
}

/// The capture thread body. Owns the camera; shares only the cancellation
/// flag with the rest of the pipeline.
pub struct CaptureWorker {
    camera: Box<dyn Camera>,
    position: Arc<dyn PositionSource>,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    last_backoff: Option<Duration>,
}

impl CaptureWorker {
    pub fn new(
        camera: Box<dyn Camera>,
        position: Arc<dyn PositionSource>,
        config: CaptureConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera,
            position,
            config,
            running,
            last_backoff: None,
        }
    }

    pub fn run(mut self) {
        info!("capture thread running");
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(self.config.poll_interval);

            if self.over_ceiling() {
                continue;
            }
            if self.gated() {
                continue;
            }
            let Some(fix) = self.position.fix_within(self.config.gps_max_age) else {
                debug!("no position fix, skipping capture");
                continue;
            };
            if let Err(err) = self.publish(&fix) {
                warn!("capture failed: {err:#}");
            }
        }
        info!("capture thread stopped");
    }

    /// Backpressure check: sleeps with escalating backoff while the directory
    /// is at its ceiling, resets the backoff once it drops below.
    fn over_ceiling(&mut self) -> bool {
        let Some(max_files) = self.config.max_files else {
            return false;
        };
        let count = match fs::read_dir(&self.config.target_dir) {
            Ok(entries) => entries.count(),
            Err(err) => {
                warn!("could not list {}: {err}", self.config.target_dir.display());
                return false;
            }
        };
        if count < max_files {
            self.last_backoff = None;
            return false;
        }

        let sleep = self.config.backoff.next(self.last_backoff);
        warn!(
            "{count} files in {} at ceiling {max_files}, sleeping {:.2}s",
            self.config.target_dir.display(),
            sleep.as_secs_f64()
        );
        std::thread::sleep(sleep);
        self.last_backoff = Some(sleep);
        true
    }

    /// Gate check: waits without touching the backoff state.
    fn gated(&self) -> bool {
        let Some(gate) = &self.config.gate_file else {
            return false;
        };
        if gate.exists() {
            return false;
        }
        debug!(
            "gate file {} absent, sleeping {:.0}s",
            gate.display(),
            self.config.gate_poll.as_secs_f64()
        );
        std::thread::sleep(self.config.gate_poll);
        true
    }

    /// Capture into a hidden temp name, then publish with one atomic rename.
    fn publish(&mut self, fix: &Fix) -> Result<()> {
        let captured_at = Local::now();
        let name = image_name(captured_at.timestamp_millis(), std::process::id());
        let final_path = self.config.target_dir.join(&name);
        let tmp_path = self.config.target_dir.join(format!("{TMP_PREFIX}{name}"));

        if let Err(err) = self.camera.capture_still(&tmp_path, fix, captured_at) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, &final_path)?;
        debug!("published {name}");
        Ok(())
    }
}

/// `<epochMillis>-<pid>.jpg`; the epoch prefix makes lexical order
/// chronological.
pub fn image_name(epoch_millis: i64, pid: u32) -> String {
    format!("{epoch_millis}-{pid}.jpg")
}
