pub mod exif;
pub mod mimetype;
pub mod thumbnail;

pub use exif::{extract_capture, CaptureMetadata};
pub use thumbnail::{
    derive_thumbnail, ensure_dir, probe_dimensions, Dimensions, MediaError, ThumbnailSpec,
    FALLBACK_DIMENSIONS,
};
