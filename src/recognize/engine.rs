//! OpenALPR command-line engine
//!
//! Drives the `alpr` tool in JSON mode and adapts its result document to
//! [`PlateRegion`]s. Different versions emit `matches_template` as either an
//! integer or a boolean; both are accepted.

use std::path::Path;
use std::process::Command;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::{PlateCandidate, PlateEngine, PlateRegion};

/// Failures from the external recognition command.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not run `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unparseable recognition output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Recognizes plates by invoking the OpenALPR CLI.
pub struct AlprCliEngine {
    command: String,
    country: String,
    region: Option<String>,
    top_n: u32,
}

impl AlprCliEngine {
    /// Probes the command once; an unavailable engine aborts startup.
    pub fn new(
        command: impl Into<String>,
        country: impl Into<String>,
        region: Option<String>,
        top_n: u32,
    ) -> Result<Self, EngineError> {
        let command = command.into();
        Command::new(&command)
            .arg("--version")
            .output()
            .map_err(|source| EngineError::Launch {
                command: command.clone(),
                source,
            })?;
        Ok(Self {
            command,
            country: country.into(),
            region,
            top_n,
        })
    }
}

impl PlateEngine for AlprCliEngine {
    fn recognize(&self, image: &Path) -> anyhow::Result<Vec<PlateRegion>> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-j")
            .arg("-c")
            .arg(&self.country)
            .arg("-n")
            .arg(self.top_n.to_string());
        if let Some(region) = &self.region {
            cmd.arg("-p").arg(region);
        }
        cmd.arg(image);

        let output = cmd.output().map_err(|source| EngineError::Launch {
            command: self.command.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(EngineError::Failed {
                command: self.command.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        let report: AlprReport =
            serde_json::from_slice(&output.stdout).map_err(EngineError::Parse)?;
        debug!(
            "alpr found {} region(s) in {}",
            report.results.len(),
            image.display()
        );
        Ok(report.results.into_iter().map(PlateRegion::from).collect())
    }
}

#[derive(Debug, Deserialize)]
struct AlprReport {
    #[serde(default)]
    results: Vec<AlprResult>,
}

#[derive(Debug, Deserialize)]
struct AlprResult {
    #[serde(default)]
    candidates: Vec<AlprCandidate>,
}

#[derive(Debug, Deserialize)]
struct AlprCandidate {
    plate: String,
    confidence: f64,
    #[serde(default, deserialize_with = "int_or_bool")]
    matches_template: bool,
}

impl From<AlprResult> for PlateRegion {
    fn from(result: AlprResult) -> Self {
        PlateRegion {
            candidates: result
                .candidates
                .into_iter()
                .map(|candidate| PlateCandidate {
                    plate: candidate.plate,
                    confidence: candidate.confidence,
                    matches_template: candidate.matches_template,
                })
                .collect(),
        }
    }
}

fn int_or_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Bool(value) => value,
        Raw::Int(value) => value != 0,
    })
}
