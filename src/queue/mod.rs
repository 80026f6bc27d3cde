//! Shared Directory Queue
//!
//! The capture directory is itself the work queue: its sorted listing is the
//! processing order (filenames start with the capture epoch, so lexical order
//! is chronological order) and per-file `.lock` sentinels provide advisory
//! claims. Workers in other processes can share the same directory; nothing
//! here assumes shared memory beyond one in-process mutex around the claim
//! sequence.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

static IMAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(.*)\.jpg$").expect("image name pattern"));

/// Suffix of advisory lock sentinels.
pub const LOCK_SUFFIX: &str = ".lock";

/// Prefix for not-yet-published captures; hidden names are never scanned.
pub const TMP_PREFIX: &str = ".tmp.";

/// Does this name belong to a published capture image?
pub fn is_image_name(name: &str) -> bool {
    IMAGE_NAME.is_match(name)
}

/// Names the scanner skips without comment: lock sentinels, hidden files
/// (which covers in-flight captures) and directory README files.
pub fn is_sentinel_name(name: &str) -> bool {
    name.ends_with(LOCK_SUFFIX) || name.starts_with('.') || name == "README"
}

/// The queue seam: listing, claiming and releasing work items. Workers only
/// talk to this, so a different claim backing can be substituted in tests.
pub trait WorkQueue: Send + Sync {
    /// Directory listing, sorted by name.
    fn list(&self) -> Result<Vec<String>>;

    /// Try to claim `name` for `owner`. `false` means another worker owns it
    /// or already finished it; both are abandoned silently by the caller.
    fn claim(&self, name: &str, owner: &str) -> Result<bool>;

    /// Drop the claim on `name`, whether or not processing succeeded.
    fn release(&self, name: &str);

    /// Full path of a queued entry.
    fn path_of(&self, name: &str) -> PathBuf;
}

/// Directory-backed queue with stale-lock reclamation.
pub struct DirQueue {
    dir: PathBuf,
    stale_lock_age: Duration,
    claim_gate: Mutex<()>,
}

impl DirQueue {
    pub fn new(dir: impl Into<PathBuf>, stale_lock_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_lock_age,
            claim_gate: Mutex::new(()),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{LOCK_SUFFIX}"))
    }
}

impl WorkQueue for DirQueue {
    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    fn claim(&self, name: &str, owner: &str) -> Result<bool> {
        // The exists-check / stale-check / create sequence is the only part
        // of the pipeline that needs true mutual exclusion.
        let _gate = self.claim_gate.lock();

        if !self.path_of(name).exists() {
            return Ok(false);
        }

        let lock = self.lock_path(name);
        match fs::metadata(&lock) {
            Ok(meta) => {
                let age = meta.modified()?.elapsed().unwrap_or(Duration::ZERO);
                if age > self.stale_lock_age {
                    warn!("removing stale lock ({}s) for {name}", age.as_secs());
                    fs::remove_file(&lock)?;
                } else {
                    return Ok(false);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        fs::write(&lock, owner)?;
        debug!("{owner} claimed {name}");
        Ok(true)
    }

    fn release(&self, name: &str) {
        if let Err(err) = fs::remove_file(self.lock_path(name)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove lock for {name}: {err}");
            }
        }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}
