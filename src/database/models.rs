use serde_json::Value;

pub type AccountId = i64;
pub type ImageId = i64;
pub type CategoryId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    /// `None` for global categories.
    pub owner: Option<AccountId>,
}

/// Image row as written by the upload pipeline and the provisioner.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub owner: AccountId,
    pub category_id: Option<CategoryId>,
    pub filename: String,
    pub filepath: String,
    pub thumbnail_path: Option<String>,
    pub file_size: u64,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    pub description: String,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub id: ImageId,
    pub owner: AccountId,
    pub category_id: Option<CategoryId>,
    pub category_name: Option<String>,
    pub filename: String,
    pub filepath: String,
    pub thumbnail_path: Option<String>,
    pub file_size: u64,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    pub description: Option<String>,
    pub metadata: Value,
    pub created_at: String,
}

/// Result of the combined image + capture metadata write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub image_id: ImageId,
    pub capture_saved: bool,
}
