//! Confidence classification policy
//!
//! Pure mapping from engine output to per-region accept/reject decisions and
//! a per-image outcome. Template-matching candidates get a lower confidence
//! floor than free-form ones; both floors are exclusive.

use super::{PlateCandidate, PlateRegion};

/// Confidence floors, by template conformance.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Exclusive floor for candidates matching the regional template.
    pub with_template: f64,
    /// Exclusive floor for candidates that do not match it.
    pub without_template: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            with_template: 75.0,
            without_template: 85.0,
        }
    }
}

/// Terminal classification of one processed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// At least one region produced an accepted plate.
    Hit,
    /// Regions were detected but none cleared its floor.
    LowConfidence,
    /// No regions were detected at all.
    NoHit,
}

/// The winning candidate for one region.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedPlate {
    pub plate: String,
    pub confidence: f64,
    pub matches_template: bool,
}

/// Pick the winning candidate for a single region, if any clears its floor.
/// The single highest-confidence clearing candidate wins across both
/// partitions; earlier candidates win ties.
pub fn classify_region(region: &PlateRegion, thresholds: &Thresholds) -> Option<AcceptedPlate> {
    let mut best: Option<&PlateCandidate> = None;
    for candidate in &region.candidates {
        let floor = if candidate.matches_template {
            thresholds.with_template
        } else {
            thresholds.without_template
        };
        if candidate.confidence <= floor {
            continue;
        }
        if best.map_or(true, |current| candidate.confidence > current.confidence) {
            best = Some(candidate);
        }
    }
    best.map(|candidate| AcceptedPlate {
        plate: candidate.plate.clone(),
        confidence: candidate.confidence,
        matches_template: candidate.matches_template,
    })
}

/// Classify a whole image: accepted plates plus the per-image outcome.
pub fn classify(regions: &[PlateRegion], thresholds: &Thresholds) -> (Vec<AcceptedPlate>, Outcome) {
    let mut accepted = Vec::new();
    let mut low_confidence = false;
    for region in regions {
        match classify_region(region, thresholds) {
            Some(plate) => accepted.push(plate),
            None => low_confidence = true,
        }
    }
    let outcome = if !accepted.is_empty() {
        Outcome::Hit
    } else if low_confidence {
        Outcome::LowConfidence
    } else {
        Outcome::NoHit
    };
    (accepted, outcome)
}
