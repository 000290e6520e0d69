//! Tagged stage outcomes and the runner that composes them.
//!
//! Each stage reports `Ok`, `Degraded` (a usable default replaced the real
//! result) or `Fatal`. The runner records degradations, and on the first
//! fatal outcome moves to `Aborted` and removes every artifact written so far
//! before handing the error back.

use std::fmt;
use std::path::Path;

use tracing::{debug, error, warn};

use crate::error::IngestError;
use crate::ingest::compensator::Compensator;
use crate::utils::context::RequestContext;

#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok(T),
    Degraded { value: T, reason: String },
    Fatal(IngestError),
}

impl<T> From<Result<T, IngestError>> for StageOutcome<T> {
    fn from(result: Result<T, IngestError>) -> Self {
        match result {
            Ok(v) => StageOutcome::Ok(v),
            Err(e) => StageOutcome::Fatal(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    StoreSource,
    Thumbnail,
    Dimensions,
    CaptureMetadata,
    Classification,
    CategoryResolution,
    Persistence,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::StoreSource => "store-source",
            Stage::Thumbnail => "thumbnail",
            Stage::Dimensions => "dimensions",
            Stage::CaptureMetadata => "capture-metadata",
            Stage::Classification => "classification",
            Stage::CategoryResolution => "category-resolution",
            Stage::Persistence => "persistence",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    ArtifactsDerived,
    Classified,
    CategoryResolved,
    Persisted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degradation {
    pub stage: Stage,
    pub reason: String,
}

/// Drives one request through its stages.
pub struct PipelineRun<'a> {
    ctx: &'a RequestContext,
    state: PipelineState,
    compensator: Compensator,
    degraded: Vec<Degradation>,
}

impl<'a> PipelineRun<'a> {
    pub fn new(ctx: &'a RequestContext) -> Self {
        Self {
            ctx,
            state: PipelineState::Received,
            compensator: Compensator::new(),
            degraded: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn degraded(&self) -> &[Degradation] {
        &self.degraded
    }

    /// Registers a file this request wrote.
    pub fn track(&mut self, path: &Path) {
        self.compensator.record(path);
    }

    pub fn advance(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "Pipeline transition");
        self.state = next;
    }

    /// Aborts if the request was cancelled or ran out of time.
    pub fn checkpoint(&mut self, before: Stage) -> Result<(), IngestError> {
        match self.ctx.checkpoint() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(before, e)),
        }
    }

    pub fn settle<T>(&mut self, stage: Stage, outcome: StageOutcome<T>) -> Result<T, IngestError> {
        match outcome {
            StageOutcome::Ok(value) => Ok(value),
            StageOutcome::Degraded { value, reason } => {
                warn!(%stage, %reason, "Stage degraded, continuing with default");
                self.degraded.push(Degradation { stage, reason });
                Ok(value)
            }
            StageOutcome::Fatal(err) => Err(self.abort(stage, err)),
        }
    }

    fn abort(&mut self, stage: Stage, err: IngestError) -> IngestError {
        error!(%stage, from = ?self.state, "Request aborted: {}", err);
        self.state = PipelineState::Aborted;
        self.compensator.compensate();
        err
    }

    /// Terminal success: artifacts are kept.
    pub fn finish(mut self) -> Vec<Degradation> {
        self.advance(PipelineState::Persisted);
        let degraded = std::mem::take(&mut self.degraded);
        std::mem::take(&mut self.compensator).commit();
        degraded
    }
}
