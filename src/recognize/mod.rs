//! Recognition layer
//!
//! The pattern-recognition engine is an external collaborator behind the
//! [`PlateEngine`] trait: given an image it returns detected plate regions,
//! each with a ranked candidate list. Everything downstream of that call —
//! classification, enrichment, recording, routing — lives in this module's
//! worker loop.

pub mod classify;
pub mod engine;
pub mod worker;

pub use classify::{Outcome, Thresholds};
pub use engine::AlprCliEngine;
pub use worker::RecognizerWorker;

use std::path::Path;

use anyhow::Result;

/// One plate-string hypothesis from the engine.
#[derive(Debug, Clone)]
pub struct PlateCandidate {
    /// Recognized text.
    pub plate: String,
    /// Engine confidence, 0-100.
    pub confidence: f64,
    /// Whether the string conforms to the expected regional format.
    pub matches_template: bool,
}

/// One detected plate region with its ranked candidates.
#[derive(Debug, Clone, Default)]
pub struct PlateRegion {
    pub candidates: Vec<PlateCandidate>,
}

/// External recognition engine boundary. The call is synchronous and may take
/// arbitrarily long; no timeout is enforced here.
pub trait PlateEngine: Send + Sync {
    fn recognize(&self, image: &Path) -> Result<Vec<PlateRegion>>;
}
