//! Position Source
//!
//! Supplies the freshest known GPS fix to the capture controller. The actual
//! receiver lives behind a daemon; see [`gpsd`] for the client.

pub mod gpsd;

use std::time::Duration;

use chrono::{DateTime, Utc};

/// A timestamped position reading.
#[derive(Debug, Clone)]
pub struct Fix {
    /// Signed decimal degrees, negative south.
    pub latitude: f64,
    /// Signed decimal degrees, negative west.
    pub longitude: f64,
    /// Meters above sea level, when the receiver reports it.
    pub altitude: Option<f64>,
    /// Speed over ground in meters per second, when reported.
    pub speed: Option<f64>,
    /// Receiver timestamp for this reading.
    pub time: DateTime<Utc>,
}

impl Fix {
    /// How long ago the receiver produced this reading.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Source of position fixes, queried by age.
pub trait PositionSource: Send + Sync {
    /// Freshest known fix, if the source has ever produced one.
    fn latest_fix(&self) -> Option<Fix>;

    /// Freshest fix no older than `max_age`.
    fn fix_within(&self, max_age: Duration) -> Option<Fix> {
        let fix = self.latest_fix()?;
        let age = fix.age();
        if age > max_age {
            tracing::debug!("position fix too old ({:.2}s)", age.as_secs_f64());
            return None;
        }
        Some(fix)
    }
}
