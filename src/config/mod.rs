//! Station configuration
//!
//! Every tunable of the pipeline lives in one TOML file, deserialized into
//! explicit per-component sections and passed down at startup. No component
//! reads shared mutable settings at runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::recognize::Thresholds;

/// Station settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Filesystem layout
    pub paths: PathsConfig,
    /// gpsd endpoint
    pub position: PositionConfig,
    /// Camera and capture-loop settings
    pub capture: CaptureSettings,
    /// Worker pool and classification settings
    pub recognizer: RecognizerSettings,
}

/// Filesystem layout of the station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Shared queue directory captures are published into.
    pub capture_dir: PathBuf,
    /// Capture only while this file exists (None = always capture).
    pub gate_file: Option<PathBuf>,
    /// Processed images with at least one accepted plate.
    pub hit_dir: PathBuf,
    /// Images whose candidates cleared no threshold (None = no-hit fallback).
    pub low_confidence_dir: Option<PathBuf>,
    /// Images with no detected plate at all (None = delete).
    pub no_hit_dir: Option<PathBuf>,
    /// Per-image JSON snapshot directory.
    pub snapshot_dir: Option<PathBuf>,
    /// Structured CSV log file.
    pub csv_log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            capture_dir: PathBuf::from("work/capture"),
            gate_file: Some(PathBuf::from("work/capture_ctl")),
            hit_dir: PathBuf::from("work/proc-hit"),
            low_confidence_dir: Some(PathBuf::from("work/proc-lowconf")),
            no_hit_dir: None,
            snapshot_dir: Some(PathBuf::from("work/output/json")),
            csv_log: Some(PathBuf::from("work/output/output.csv")),
        }
    }
}

impl PathsConfig {
    /// Create every configured directory, including the parents of file
    /// outputs.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.capture_dir)?;
        std::fs::create_dir_all(&self.hit_dir)?;
        for dir in [&self.low_confidence_dir, &self.no_hit_dir, &self.snapshot_dir]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.csv_log.as_ref().and_then(|path| path.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Where the gpsd daemon listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    pub host: String,
    pub port: u16,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2947,
        }
    }
}

/// Which camera collaborator to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    /// External still-capture command.
    #[default]
    Command,
    /// In-process gradient frames (no hardware).
    Synthetic,
}

/// Camera and capture-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub camera: CameraKind,
    /// External still-capture command for `camera = "command"`.
    pub still_command: String,
    pub width: u32,
    pub height: u32,
    pub hflip: bool,
    pub vflip: bool,
    /// 0 leaves the camera gain untouched.
    pub iso: u32,
    pub exposure_mode: Option<String>,
    pub jpg_quality: u8,
    /// Base poll interval between capture cycles.
    pub poll_interval_ms: u64,
    /// Queue-directory file ceiling (None = unlimited).
    pub max_files: Option<usize>,
    /// Oldest acceptable position fix.
    pub gps_max_age_secs: u64,
    /// Wait between gate-file checks.
    pub gate_poll_secs: u64,
    pub backoff_initial_secs: f64,
    pub backoff_max_secs: f64,
    pub backoff_factor: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera: CameraKind::Command,
            still_command: "rpicam-still".to_string(),
            width: 1640,
            height: 1232,
            hflip: false,
            vflip: false,
            iso: 0,
            exposure_mode: None,
            jpg_quality: 85,
            poll_interval_ms: 1000,
            max_files: Some(10_000),
            gps_max_age_secs: 10,
            gate_poll_secs: 3,
            backoff_initial_secs: 0.5,
            backoff_max_secs: 30.0,
            backoff_factor: 1.25,
        }
    }
}

/// Recognition worker pool and classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerSettings {
    /// Worker threads scanning the queue.
    pub workers: usize,
    pub scan_interval_ms: u64,
    /// Locks older than this are presumed abandoned and reclaimed.
    pub stale_lock_secs: u64,
    pub min_confidence_with_template: f64,
    pub min_confidence_without_template: f64,
    /// OpenALPR command-line tool.
    pub alpr_command: String,
    pub country: String,
    /// Regional template hint (e.g. "ma").
    pub default_region: Option<String>,
    /// Candidates requested per detected region.
    pub top_n: u32,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            scan_interval_ms: 50,
            stale_lock_secs: 120,
            min_confidence_with_template: 75.0,
            min_confidence_without_template: 85.0,
            alpr_command: "alpr".to_string(),
            country: "us".to_string(),
            default_region: None,
            top_n: 10,
        }
    }
}

impl RecognizerSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            with_template: self.min_confidence_with_template,
            without_template: self.min_confidence_without_template,
        }
    }
}

/// Load configuration from file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Default config location (e.g. `~/.config/platewatch/config.toml`).
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "platewatch", "platewatch")
        .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
    Ok(dirs.config_dir().join("config.toml"))
}
