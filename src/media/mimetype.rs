use std::path::Path;
use anyhow::{Result, Context};

use crate::error::ValidationError;

pub const OCTET_STREAM: &str = "application/octet-stream";

const ACCEPTED_EXTENSIONS: &[&str] = &["jpg", "jpeg"];
const ACCEPTED_MEDIA_TYPES: &[&str] = &["image/jpeg", "image/jpg"];

pub fn detect_mimetype(path: &Path) -> Result<String> {
    let kind = infer::get_from_path(path)
        .context("Failed to read file for mimetype detection")?;

    match kind {
        Some(k) => Ok(k.mime_type().to_string()),
        None => Ok(OCTET_STREAM.to_string()),
    }
}

pub fn detect_mimetype_bytes(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|k| k.mime_type().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Lowercased extension of an uploaded file name, if it has one.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Checks an upload before anything is written. Returns the accepted extension.
pub fn validate_upload(
    original_name: &str,
    declared_type: &str,
    bytes: &[u8],
    max_bytes: u64,
) -> Result<String, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }

    let size = bytes.len() as u64;
    if size > max_bytes {
        return Err(ValidationError::TooLarge { size, limit: max_bytes });
    }

    let extension = extension_of(original_name)
        .filter(|e| ACCEPTED_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| ValidationError::UnsupportedExtension(original_name.to_string()))?;

    let declared = declared_type.trim().to_ascii_lowercase();
    if !ACCEPTED_MEDIA_TYPES.contains(&declared.as_str()) {
        return Err(ValidationError::UnsupportedMediaType(declared_type.to_string()));
    }

    let detected = detect_mimetype_bytes(bytes);
    if !ACCEPTED_MEDIA_TYPES.contains(&detected.as_str()) {
        return Err(ValidationError::ContentMismatch { detected });
    }

    Ok(extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    #[test]
    fn test_accepts_jpeg() {
        let ext = validate_upload("Holiday.JPG", "image/jpeg", JPEG_MAGIC, 1024).unwrap();
        assert_eq!(ext, "jpg");
    }

    #[test]
    fn test_rejects_before_reading_content() {
        assert_eq!(validate_upload("a.jpg", "image/jpeg", &[], 10), Err(ValidationError::Empty));
        assert_eq!(
            validate_upload("a.jpg", "image/jpeg", JPEG_MAGIC, 4),
            Err(ValidationError::TooLarge { size: JPEG_MAGIC.len() as u64, limit: 4 })
        );
        assert!(matches!(
            validate_upload("a.png", "image/jpeg", JPEG_MAGIC, 1024),
            Err(ValidationError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            validate_upload("noext", "image/jpeg", JPEG_MAGIC, 1024),
            Err(ValidationError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            validate_upload("a.jpg", "image/png", JPEG_MAGIC, 1024),
            Err(ValidationError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_rejects_disguised_content() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(
            validate_upload("a.jpg", "image/jpeg", &png, 1024),
            Err(ValidationError::ContentMismatch { detected: "image/png".to_string() })
        );
    }

    #[test]
    fn test_mimetype_detection_from_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"plain words")?;
        assert_eq!(detect_mimetype(&path)?, OCTET_STREAM);

        std::fs::write(&path, JPEG_MAGIC)?;
        assert_eq!(detect_mimetype(&path)?, "image/jpeg");
        Ok(())
    }
}
