//! Display artifacts derived from a stored original: a cover-cropped
//! thumbnail and the intrinsic pixel dimensions.

use std::fs;
use std::io;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Used by provisioning when a template cannot be probed.
pub const FALLBACK_DIMENSIONS: Dimensions = Dimensions { width: 800, height: 600 };

/// Target box for a thumbnail. The source is scaled to cover the box and
/// center-cropped to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSpec {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSpec {
    pub fn square(edge: u32) -> Self {
        Self { width: edge, height: edge }
    }
}

impl Default for ThumbnailSpec {
    fn default() -> Self {
        Self::square(300)
    }
}

/// Creates `path` and its parents. Succeeds if the directory already exists.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn derive_thumbnail(source: &Path, target: &Path, spec: ThumbnailSpec) -> Result<(), MediaError> {
    if let Some(parent) = target.parent() {
        ensure_dir(parent)?;
    }

    let img = ImageReader::open(source)?
        .with_guessed_format()?
        .decode()
        .map_err(|source_err| MediaError::Decode {
            path: source.display().to_string(),
            source: source_err,
        })?;

    let filled = img.resize_to_fill(spec.width, spec.height, FilterType::Lanczos3);
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(filled.to_rgb8());

    rgb.save(target).map_err(|e| MediaError::Encode {
        path: target.display().to_string(),
        source: e,
    })
}

/// Reads width and height from the header without decoding pixels.
pub fn probe_dimensions(source: &Path) -> Result<Dimensions, MediaError> {
    let (width, height) = image::image_dimensions(source).map_err(|e| MediaError::Decode {
        path: source.display().to_string(),
        source: e,
    })?;
    Ok(Dimensions { width, height })
}
