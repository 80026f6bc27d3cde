//! Result Sink
//!
//! Durable recording of accepted matches — an append-only CSV log shared by
//! every worker plus a per-image JSON snapshot — and final placement of each
//! processed image according to its outcome.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::recognize::Outcome;

/// The accepted result for one detected plate region, with enrichment from
/// the image's embedded tags. Field order is the CSV column order; formatted
/// fields serialize as fixed-precision strings in both the log and the
/// snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct MatchRecord {
    pub recognize_time: String,
    pub recognize_epoch_time: i64,
    pub plate: String,
    #[serde(serialize_with = "two_places")]
    pub confidence: f64,
    pub matches_template: bool,
    pub file: String,
    #[serde(serialize_with = "four_places")]
    pub recognize_secs: f64,
    /// Empty when the capture timestamp tag was absent.
    pub capture_time: String,
    /// 0 when the capture timestamp tag was absent.
    pub capture_epoch_time: i64,
    #[serde(serialize_with = "seven_places")]
    pub capture_latitude: f64,
    #[serde(serialize_with = "seven_places")]
    pub capture_longitude: f64,
    #[serde(serialize_with = "two_places")]
    pub capture_altitude_m: f64,
}

fn two_places<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.2}"))
}

fn four_places<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.4}"))
}

fn seven_places<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.7}"))
}

/// Match persistence: CSV log and/or JSON snapshots.
pub struct ResultSink {
    csv: Option<CsvLog>,
    snapshots: Option<SnapshotDir>,
}

impl ResultSink {
    /// At least one output must be configured.
    pub fn new(csv_log: Option<PathBuf>, snapshot_dir: Option<PathBuf>) -> Result<Self> {
        if csv_log.is_none() && snapshot_dir.is_none() {
            bail!("result sink needs a CSV log path and/or a snapshot directory");
        }
        Ok(Self {
            csv: csv_log.map(CsvLog::new),
            snapshots: snapshot_dir.map(|dir| SnapshotDir { dir }),
        })
    }

    /// Persist every record for one source image.
    pub fn record(&self, source_name: &str, records: &[MatchRecord]) -> Result<()> {
        if let Some(csv) = &self.csv {
            csv.append_all(records).context("appending to CSV log")?;
        }
        if let Some(snapshots) = &self.snapshots {
            snapshots
                .write(source_name, records)
                .context("writing snapshot")?;
        }
        Ok(())
    }
}

/// Append-only CSV shared across workers. The header-check-then-append
/// sequence runs under a mutex; the header row is written lazily the first
/// time the file does not yet exist.
struct CsvLog {
    path: PathBuf,
    gate: Mutex<()>,
}

impl CsvLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            gate: Mutex::new(()),
        }
    }

    fn append_all(&self, records: &[MatchRecord]) -> Result<()> {
        let _gate = self.gate.lock();
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One JSON document per source image. Snapshot names derive from the unique
/// source name, so no cross-worker lock is needed.
struct SnapshotDir {
    dir: PathBuf,
}

impl SnapshotDir {
    fn write(&self, source_name: &str, records: &[MatchRecord]) -> Result<()> {
        let stem = source_name.strip_suffix(".jpg").unwrap_or(source_name);
        let path = self.dir.join(format!("{stem}.json"));
        let file = fs::File::create(&path)?;
        serde_json::to_writer(file, records)?;
        Ok(())
    }
}

/// Where a processed image ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedTo {
    Moved(PathBuf),
    Deleted,
}

/// Final placement of processed images by outcome. Unset directories fall
/// back: low-confidence to the no-hit directory, and no-hit to deletion.
#[derive(Debug, Clone)]
pub struct Router {
    hit_dir: PathBuf,
    low_confidence_dir: Option<PathBuf>,
    no_hit_dir: Option<PathBuf>,
}

impl Router {
    pub fn new(
        hit_dir: PathBuf,
        low_confidence_dir: Option<PathBuf>,
        no_hit_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            hit_dir,
            low_confidence_dir,
            no_hit_dir,
        }
    }

    pub fn route(&self, source: &Path, name: &str, outcome: Outcome) -> Result<RoutedTo> {
        let dest_dir = match outcome {
            Outcome::Hit => Some(&self.hit_dir),
            Outcome::LowConfidence => self
                .low_confidence_dir
                .as_ref()
                .or(self.no_hit_dir.as_ref()),
            Outcome::NoHit => self.no_hit_dir.as_ref(),
        };
        match dest_dir {
            Some(dir) => {
                let dest = dir.join(name);
                fs::rename(source, &dest)
                    .with_context(|| format!("moving {name} to {}", dir.display()))?;
                Ok(RoutedTo::Moved(dest))
            }
            None => {
                fs::remove_file(source).with_context(|| format!("deleting {name}"))?;
                Ok(RoutedTo::Deleted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(plate: &str) -> MatchRecord {
        MatchRecord {
            recognize_time: "2026-08-06 10:30:00".to_string(),
            recognize_epoch_time: 1754475000,
            plate: plate.to_string(),
            confidence: 91.2,
            matches_template: true,
            file: "1700000000000-42.jpg".to_string(),
            recognize_secs: 0.73219,
            capture_time: "2026-08-06 10:29:58".to_string(),
            capture_epoch_time: 1754474998,
            capture_latitude: -42.12345666,
            capture_longitude: 18.76543222,
            capture_altitude_m: 132.5,
        }
    }

    const HEADER: &str = "recognize_time,recognize_epoch_time,plate,confidence,matches_template,\
                          file,recognize_secs,capture_time,capture_epoch_time,capture_latitude,\
                          capture_longitude,capture_altitude_m";

    #[test]
    fn sink_requires_at_least_one_output() {
        assert!(ResultSink::new(None, None).is_err());
    }

    #[test]
    fn csv_header_is_written_once_with_fixed_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.csv");
        let sink = ResultSink::new(Some(path.clone()), None).expect("sink");

        sink.record("1700000000000-42.jpg", &[record("ABC123")])
            .expect("first record");
        sink.record("1700000000001-42.jpg", &[record("XYZ999")])
            .expect("second record");

        let content = fs::read_to_string(&path).expect("read csv");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].contains("ABC123"));
        assert!(lines[2].contains("XYZ999"));
    }

    #[test]
    fn csv_values_use_fixed_precision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.csv");
        let sink = ResultSink::new(Some(path.clone()), None).expect("sink");
        sink.record("1700000000000-42.jpg", &[record("ABC123")])
            .expect("record");

        let content = fs::read_to_string(&path).expect("read csv");
        let row = content.lines().nth(1).expect("row");
        assert!(row.contains(",91.20,"));
        assert!(row.contains(",0.7322,"));
        assert!(row.contains(",-42.1234567,"));
        assert!(row.contains(",18.7654322,"));
        assert!(row.contains(",132.50"));
        assert!(row.contains(",true,"));
    }

    #[test]
    fn existing_log_gets_no_second_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.csv");
        let sink = ResultSink::new(Some(path.clone()), None).expect("sink");
        sink.record("a.jpg", &[record("ABC123")]).expect("record");

        // A fresh sink over the same file must not repeat the header.
        let reopened = ResultSink::new(Some(path.clone()), None).expect("sink");
        reopened.record("b.jpg", &[record("DEF456")]).expect("record");

        let content = fs::read_to_string(&path).expect("read csv");
        assert_eq!(content.matches("recognize_time").count(), 1);
    }

    #[test]
    fn one_row_per_match_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.csv");
        let sink = ResultSink::new(Some(path.clone()), None).expect("sink");
        sink.record(
            "1700000000000-42.jpg",
            &[record("ABC123"), record("DEF456")],
        )
        .expect("record");

        let content = fs::read_to_string(&path).expect("read csv");
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn snapshot_holds_the_full_record_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink =
            ResultSink::new(None, Some(dir.path().to_path_buf())).expect("sink");
        sink.record(
            "1700000000000-42.jpg",
            &[record("ABC123"), record("DEF456")],
        )
        .expect("record");

        let content =
            fs::read_to_string(dir.path().join("1700000000000-42.json")).expect("read snapshot");
        let parsed: serde_json::Value = serde_json::from_str(&content).expect("parse");
        let records = parsed.as_array().expect("array");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["plate"], "ABC123");
        assert_eq!(records[0]["confidence"], "91.20");
        assert_eq!(records[0]["capture_latitude"], "-42.1234567");
        assert_eq!(records[1]["plate"], "DEF456");
    }

    #[test]
    fn routing_follows_outcomes_and_fallbacks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hit = dir.path().join("hit");
        let lowconf = dir.path().join("lowconf");
        let nohit = dir.path().join("nohit");
        for d in [&hit, &lowconf, &nohit] {
            fs::create_dir(d).expect("mkdir");
        }
        let src = |name: &str| {
            let path = dir.path().join(name);
            fs::write(&path, b"jpeg").expect("write");
            path
        };

        let full = Router::new(hit.clone(), Some(lowconf.clone()), Some(nohit.clone()));
        assert_eq!(
            full.route(&src("a.jpg"), "a.jpg", Outcome::Hit).expect("route"),
            RoutedTo::Moved(hit.join("a.jpg"))
        );
        assert_eq!(
            full.route(&src("b.jpg"), "b.jpg", Outcome::LowConfidence)
                .expect("route"),
            RoutedTo::Moved(lowconf.join("b.jpg"))
        );
        assert_eq!(
            full.route(&src("c.jpg"), "c.jpg", Outcome::NoHit).expect("route"),
            RoutedTo::Moved(nohit.join("c.jpg"))
        );

        // Low-confidence falls back to the no-hit directory, then to deletion.
        let no_lowconf = Router::new(hit.clone(), None, Some(nohit.clone()));
        assert_eq!(
            no_lowconf
                .route(&src("d.jpg"), "d.jpg", Outcome::LowConfidence)
                .expect("route"),
            RoutedTo::Moved(nohit.join("d.jpg"))
        );

        let hit_only = Router::new(hit.clone(), None, None);
        assert_eq!(
            hit_only
                .route(&src("e.jpg"), "e.jpg", Outcome::LowConfidence)
                .expect("route"),
            RoutedTo::Deleted
        );
        assert_eq!(
            hit_only
                .route(&src("f.jpg"), "f.jpg", Outcome::NoHit)
                .expect("route"),
            RoutedTo::Deleted
        );
        assert!(!dir.path().join("e.jpg").exists());
    }
}
