//! Classification bridge.
//!
//! A [`Classifier`] produces the raw worker result for one image. The
//! [`ClassificationBridge`] turns whatever comes back, including every kind of
//! failure, into a [`Classification`] the pipeline can persist. It never fails.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::ingest::stage::StageOutcome;
use crate::utils::context::RequestContext;

/// Reserved name of the global catch-all category.
pub const CATCH_ALL_CATEGORY: &str = "other";

pub const DEFAULT_DESCRIPTION: &str = "This picture looks rather interesting!";

/// Structured result the inference worker prints on success.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkerOutput {
    #[serde(default, alias = "finalLabel")]
    pub final_label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "rawObjects", alias = "yolo_objects")]
    pub raw_objects: Option<Vec<Value>>,
    #[serde(default, alias = "auxiliaryDescription", alias = "clip_desc")]
    pub auxiliary_description: Option<String>,
}

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),
    #[error("worker exited with {}: {stderr}", code.map_or("a signal".to_string(), |c| format!("status {c}")))]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("worker output is not a valid result: {0}")]
    Malformed(String),
    #[error("worker timed out after {0:?}")]
    TimedOut(Duration),
    #[error("classification cancelled")]
    Cancelled,
    #[error("classifier pool is shut down")]
    PoolClosed,
}

/// Anything that can label an image on disk: an external process, a pool in
/// front of one, an in-process model, a remote service.
pub trait Classifier: Send + Sync {
    fn classify(&self, path: &Path, ctx: &RequestContext) -> Result<WorkerOutput, ClassifyError>;
}

/// Normalized classification carried forward by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub description: String,
    pub metadata: Value,
}

impl Classification {
    /// Deterministic result used whenever the worker cannot be trusted.
    pub fn fallback(error: &str) -> Self {
        Self {
            label: CATCH_ALL_CATEGORY.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            metadata: json!({
                "error": error,
                "final_label": null,
                "auxiliary_description": null,
            }),
        }
    }

    /// Static classification for a provisioned default asset.
    pub fn default_asset(category: &str, caption: &str) -> Self {
        Self {
            label: category.to_string(),
            description: caption.to_string(),
            metadata: json!({
                "final_label": category,
                "raw_objects": [],
                "auxiliary_description": format!("a photo of {}", category.to_lowercase()),
                "is_default": true,
            }),
        }
    }

    fn from_output(output: WorkerOutput) -> Self {
        let label = non_blank(output.final_label);
        let description = non_blank(output.description);
        Self {
            label: label.clone().unwrap_or_else(|| CATCH_ALL_CATEGORY.to_string()),
            description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            metadata: json!({
                "final_label": label,
                "raw_objects": output.raw_objects.unwrap_or_default(),
                "auxiliary_description": output.auxiliary_description,
            }),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Parses the worker's stdout. The whole output must be one JSON object.
pub fn parse_worker_output(stdout: &str) -> Result<WorkerOutput, ClassifyError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ClassifyError::Malformed("empty output".to_string()));
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| ClassifyError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ClassifyError::Malformed("expected a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| ClassifyError::Malformed(e.to_string()))
}

/// Maps a worker result onto the pipeline's stage outcome: a clean result is
/// `Ok`, every failure is `Degraded` with the fallback.
pub fn normalize(result: Result<WorkerOutput, ClassifyError>) -> StageOutcome<Classification> {
    match result {
        Ok(output) => StageOutcome::Ok(Classification::from_output(output)),
        Err(err) => {
            let reason = err.to_string();
            StageOutcome::Degraded {
                value: Classification::fallback(&reason),
                reason,
            }
        }
    }
}

#[derive(Clone)]
pub struct ClassificationBridge {
    classifier: Arc<dyn Classifier>,
}

impl ClassificationBridge {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    pub fn classify(&self, path: &Path, ctx: &RequestContext) -> StageOutcome<Classification> {
        let result = self.classifier.classify(path, ctx);
        if let Err(ref err) = result {
            warn!(path = %path.display(), error = %err, "Classification failed, using fallback");
        }
        let outcome = normalize(result);
        if let StageOutcome::Ok(ref c) = outcome {
            info!(path = %path.display(), label = %c.label, "Image classified");
        }
        outcome
    }
}
