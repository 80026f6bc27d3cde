//! platewatch - unattended GPS-tagged capture and plate recognition station
//!
//! A single producer publishes geotagged JPEGs into a shared directory; a
//! pool of recognition workers consumes that directory as a queue, using the
//! filesystem itself for ordering and mutual exclusion. Results land in a
//! CSV log and per-image JSON snapshots; processed images are filed by
//! outcome.

mod app;
mod capture;
mod config;
mod geotag;
mod position;
mod queue;
mod recognize;
mod sink;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::Pipeline;
use crate::capture::camera::{Camera, CommandCamera, SyntheticCamera};
use crate::config::{AppConfig, CameraKind};
use crate::position::gpsd::GpsdSource;
use crate::position::PositionSource;
use crate::recognize::{AlprCliEngine, PlateEngine};

/// platewatch - GPS-tagged capture station with plate recognition
#[derive(Parser, Debug)]
#[command(name = "platewatch")]
#[command(about = "Unattended GPS-tagged capture and license-plate recognition station")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the default configuration to the config path and exit
    #[arg(long)]
    write_default_config: bool,

    /// Override the configured recognition worker count
    #[arg(long)]
    workers: Option<usize>,

    /// Use the in-process synthetic camera regardless of configuration
    #[arg(long)]
    synthetic_camera: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    if args.write_default_config {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config::save_config(&AppConfig::default(), &config_path)?;
        println!("wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let mut config = if config_path.exists() {
        let config = config::load_config(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        info!("loaded configuration from {}", config_path.display());
        config
    } else {
        info!("no configuration at {}, using defaults", config_path.display());
        AppConfig::default()
    };
    if let Some(workers) = args.workers {
        config.recognizer.workers = workers;
    }
    if args.synthetic_camera {
        config.capture.camera = CameraKind::Synthetic;
    }

    // External collaborators; any failure here aborts startup.
    let camera: Box<dyn Camera> = match config.capture.camera {
        CameraKind::Command => Box::new(
            CommandCamera::new(config.capture.clone()).context("setting up camera")?,
        ),
        CameraKind::Synthetic => Box::new(SyntheticCamera::from_settings(&config.capture)),
    };
    let position: Arc<dyn PositionSource> = Arc::new(
        GpsdSource::connect(&config.position.host, config.position.port)
            .context("setting up position source")?,
    );
    let engine: Arc<dyn PlateEngine> = Arc::new(
        AlprCliEngine::new(
            config.recognizer.alpr_command.as_str(),
            config.recognizer.country.as_str(),
            config.recognizer.default_region.clone(),
            config.recognizer.top_n,
        )
        .context("loading recognition engine")?,
    );

    let mut pipeline = Pipeline::start(&config, camera, position, engine)?;

    let running = pipeline.running();
    ctrlc::set_handler({
        let running = Arc::clone(&running);
        move || {
            info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
        }
    })
    .context("installing signal handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    pipeline.stop();
    info!("platewatch shutdown complete");
    Ok(())
}
