pub mod models;
pub mod repo;
pub mod resolver;
pub mod schema;

pub use models::{AccountId, Category, CategoryId, ImageId, NewImage, StoredImage, WriteOutcome};
pub use repo::{Database, ImageStore};
pub use resolver::{CategoryResolver, ResolvedCategory};
