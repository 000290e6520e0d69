pub mod classifier;
pub mod pool;
pub mod worker;

pub use classifier::{
    Classification, ClassificationBridge, Classifier, ClassifyError, WorkerOutput,
    CATCH_ALL_CATEGORY, DEFAULT_DESCRIPTION,
};
pub use pool::ClassifierPool;
pub use worker::ProcessClassifier;
