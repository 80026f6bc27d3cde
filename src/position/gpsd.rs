//! gpsd client
//!
//! Watches a gpsd daemon over its JSON protocol and caches the freshest
//! TPV report as a [`Fix`]. A connection failure at startup is fatal to the
//! station; a dropped connection afterwards simply stops fix updates, and the
//! capture controller skips cycles once the cached fix ages out.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Fix, PositionSource};

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Read timeout doubles as the cancellation check granularity.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(tag = "class")]
enum GpsdMessage {
    #[serde(rename = "TPV")]
    Tpv {
        #[serde(default)]
        mode: u8,
        #[serde(default)]
        time: Option<DateTime<Utc>>,
        #[serde(default)]
        lat: Option<f64>,
        #[serde(default)]
        lon: Option<f64>,
        #[serde(default)]
        alt: Option<f64>,
        #[serde(default)]
        speed: Option<f64>,
    },
    #[serde(other)]
    Other,
}

/// Position source backed by a gpsd daemon.
pub struct GpsdSource {
    latest: Arc<RwLock<Option<Fix>>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl GpsdSource {
    /// Connect, enable the JSON watch stream and start the reader thread.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream =
            TcpStream::connect(&addr).with_context(|| format!("connecting to gpsd at {addr}"))?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut writer = stream.try_clone()?;
        writer.write_all(WATCH_COMMAND)?;
        writer.flush()?;
        info!("watching gpsd at {addr}");

        let latest = Arc::new(RwLock::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let reader = std::thread::Builder::new().name("gpsd".into()).spawn({
            let latest = Arc::clone(&latest);
            let running = Arc::clone(&running);
            move || reader_loop(stream, &latest, &running)
        })?;

        Ok(Self {
            latest,
            running,
            reader: Some(reader),
        })
    }

    /// Stop the reader thread and wait for it to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl PositionSource for GpsdSource {
    fn latest_fix(&self) -> Option<Fix> {
        self.latest.read().clone()
    }
}

impl Drop for GpsdSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(stream: TcpStream, latest: &RwLock<Option<Fix>>, running: &AtomicBool) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while running.load(Ordering::SeqCst) {
        match reader.read_line(&mut line) {
            Ok(0) => {
                warn!("gpsd closed the connection");
                break;
            }
            Ok(_) => {
                if let Some(fix) = parse_report(line.trim()) {
                    debug!(
                        "fix {:.6},{:.6} at {}",
                        fix.latitude, fix.longitude, fix.time
                    );
                    *latest.write() = Some(fix);
                }
                line.clear();
            }
            // Timeouts are the cancellation poll; a partial line stays in
            // `line` and the next read_line continues it.
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                warn!("gpsd read failed: {err}");
                break;
            }
        }
    }
}

/// Parse one report line; only 2D/3D TPV reports carry a usable fix.
fn parse_report(line: &str) -> Option<Fix> {
    if line.is_empty() {
        return None;
    }
    let message: GpsdMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => {
            debug!("unparseable gpsd report: {err}");
            return None;
        }
    };
    match message {
        GpsdMessage::Tpv {
            mode,
            time,
            lat: Some(latitude),
            lon: Some(longitude),
            alt,
            speed,
        } if mode >= 2 => Some(Fix {
            latitude,
            longitude,
            altitude: alt,
            speed,
            time: time.unwrap_or_else(Utc::now),
        }),
        _ => None,
    }
}
