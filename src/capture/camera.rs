//! Camera collaborators
//!
//! The camera is an external facility: it fills a destination path with JPEG
//! bytes carrying the fix's geotags. `CommandCamera` drives a real capture
//! stack through its command-line tool; `SyntheticCamera` generates frames
//! in-process so the pipeline can run (and be tested) with no hardware.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use image::{ImageBuffer, Rgb};
use tracing::debug;

use crate::config::CaptureSettings;
use crate::geotag;
use crate::position::Fix;

/// Fills `dest` with a geotagged JPEG. Implementations are driven from the
/// single capture thread, so `&mut self` is fine.
pub trait Camera: Send {
    fn capture_still(
        &mut self,
        dest: &Path,
        fix: &Fix,
        captured_at: DateTime<Local>,
    ) -> Result<()>;
}

/// Drives an external still-capture command (`rpicam-still`-compatible flags)
/// and splices the GPS tags into its output file.
pub struct CommandCamera {
    settings: CaptureSettings,
}

impl CommandCamera {
    /// Probes the configured command once; an absent camera stack is fatal.
    pub fn new(settings: CaptureSettings) -> Result<Self> {
        Command::new(&settings.still_command)
            .arg("--version")
            .output()
            .with_context(|| format!("camera command `{}` unavailable", settings.still_command))?;
        Ok(Self { settings })
    }
}

impl Camera for CommandCamera {
    fn capture_still(
        &mut self,
        dest: &Path,
        fix: &Fix,
        captured_at: DateTime<Local>,
    ) -> Result<()> {
        let settings = &self.settings;
        let mut cmd = Command::new(&settings.still_command);
        cmd.arg("-o")
            .arg(dest)
            .arg("--width")
            .arg(settings.width.to_string())
            .arg("--height")
            .arg(settings.height.to_string())
            .arg("--quality")
            .arg(settings.jpg_quality.to_string());
        if settings.hflip {
            cmd.arg("--hflip");
        }
        if settings.vflip {
            cmd.arg("--vflip");
        }
        if let Some(mode) = &settings.exposure_mode {
            cmd.arg("--exposure").arg(mode);
        }
        if settings.iso > 0 {
            // rpicam-still takes analog gain, roughly ISO/100.
            cmd.arg("--gain")
                .arg(format!("{:.1}", f64::from(settings.iso) / 100.0));
        }

        let output = cmd
            .output()
            .with_context(|| format!("running `{}`", settings.still_command))?;
        if !output.status.success() {
            bail!(
                "`{}` exited with {}: {}",
                settings.still_command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let tagged = geotag::tag_jpeg(fs::read(dest)?, fix, captured_at)?;
        fs::write(dest, tagged)?;
        Ok(())
    }
}

/// In-process camera producing gradient frames.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    quality: u8,
    frame: u32,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width,
            height,
            quality,
            frame: 0,
        }
    }

    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self::new(settings.width, settings.height, settings.jpg_quality)
    }
}

impl Camera for SyntheticCamera {
    fn capture_still(
        &mut self,
        dest: &Path,
        fix: &Fix,
        captured_at: DateTime<Local>,
    ) -> Result<()> {
        self.frame = self.frame.wrapping_add(1);
        let shift = self.frame;
        let image = ImageBuffer::from_fn(self.width, self.height, |x, y| {
            let value = ((x + y + shift) % 256) as u8;
            Rgb([value, value, value])
        });

        let mut encoded = std::io::Cursor::new(Vec::new());
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, self.quality)
            .encode_image(&image)
            .context("encoding synthetic frame")?;

        let tagged = geotag::tag_jpeg(encoded.into_inner(), fix, captured_at)?;
        fs::write(dest, tagged)?;
        debug!("synthetic frame {} -> {}", self.frame, dest.display());
        Ok(())
    }
}
