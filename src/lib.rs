//! Media ingestion: stores uploaded images together with a thumbnail,
//! capture metadata and a classification, or nothing at all.

pub mod database;
pub mod error;
pub mod ingest;
pub mod media;
pub mod ml;
pub mod utils;

pub use error::{IngestError, ValidationError};
