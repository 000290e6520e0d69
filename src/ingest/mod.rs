pub mod artifacts;
pub mod compensator;
pub mod hasher;
pub mod pipeline;
pub mod provision;
pub mod stage;
pub mod storage;

pub use compensator::Compensator;
pub use pipeline::{UploadPipeline, UploadRequest, UploadSettings, UploadedImage};
pub use provision::{DefaultAsset, DefaultProvisioner, ProvisionReport, SkippedAsset, DEFAULT_ASSETS};
pub use stage::{Degradation, PipelineRun, PipelineState, Stage, StageOutcome};
pub use storage::StorageLayout;
