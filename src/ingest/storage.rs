//! Per-account storage layout.
//!
//! ```text
//! <root>/user_<id>/<filename>                     original
//! <root>/user_<id>/thumbnails/thumb_<filename>    thumbnail
//! ```
//!
//! Rows store the same layout under a public prefix (`/uploads/user_<id>/...`).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::database::models::AccountId;
use crate::media::thumbnail::ensure_dir;

pub const THUMBNAIL_DIR: &str = "thumbnails";
pub const THUMBNAIL_PREFIX: &str = "thumb_";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    public_prefix: String,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        Self { root: root.into(), public_prefix: public_prefix.into() }
    }

    fn account_segment(account: AccountId) -> String {
        format!("user_{}", account)
    }

    pub fn account_dir(&self, account: AccountId) -> PathBuf {
        self.root.join(Self::account_segment(account))
    }

    pub fn thumbnail_dir(&self, account: AccountId) -> PathBuf {
        self.account_dir(account).join(THUMBNAIL_DIR)
    }

    pub fn original_path(&self, account: AccountId, filename: &str) -> PathBuf {
        self.account_dir(account).join(filename)
    }

    pub fn thumbnail_path(&self, account: AccountId, filename: &str) -> PathBuf {
        self.thumbnail_dir(account).join(thumbnail_name(filename))
    }

    pub fn public_original(&self, account: AccountId, filename: &str) -> String {
        format!("{}/{}/{}", self.public_prefix, Self::account_segment(account), filename)
    }

    pub fn public_thumbnail(&self, account: AccountId, filename: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.public_prefix,
            Self::account_segment(account),
            THUMBNAIL_DIR,
            thumbnail_name(filename)
        )
    }

    /// Creates the account directory if it does not exist yet.
    pub fn ensure_account_dir(&self, account: AccountId) -> io::Result<PathBuf> {
        let dir = self.account_dir(account);
        ensure_dir(&dir)?;
        Ok(dir)
    }
}

pub fn thumbnail_name(filename: &str) -> String {
    format!("{}{}", THUMBNAIL_PREFIX, filename)
}

/// Opens `dir/<filename>` for writing without ever replacing an existing
/// file; on a clash a numeric suffix is added to the stem. Returns the open
/// file and the name actually used.
pub fn create_unique(dir: &Path, filename: &str) -> io::Result<(File, String)> {
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
    let ext = path.extension().and_then(|e| e.to_str());

    let mut candidate = filename.to_string();
    for attempt in 1..=100 {
        match OpenOptions::new().write(true).create_new(true).open(dir.join(&candidate)) {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                candidate = match ext {
                    Some(ext) => format!("{}-{}.{}", stem, attempt, ext),
                    None => format!("{}-{}", stem, attempt),
                };
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("no free name for {}", filename)))
}

pub fn write_all_synced(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes)?;
    file.sync_all()
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/srv/uploads", "/uploads");
        assert_eq!(layout.original_path(4, "a.jpg"), PathBuf::from("/srv/uploads/user_4/a.jpg"));
        assert_eq!(
            layout.thumbnail_path(4, "a.jpg"),
            PathBuf::from("/srv/uploads/user_4/thumbnails/thumb_a.jpg")
        );
        assert_eq!(layout.public_original(4, "a.jpg"), "/uploads/user_4/a.jpg");
        assert_eq!(layout.public_thumbnail(4, "a.jpg"), "/uploads/user_4/thumbnails/thumb_a.jpg");
    }

    #[test]
    fn test_account_dir_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "/uploads");
        let first = layout.ensure_account_dir(9).unwrap();
        let second = layout.ensure_account_dir(9).unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[test]
    fn test_create_unique_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.jpg"), b"first").unwrap();

        let (mut file, name) = create_unique(dir.path(), "x.jpg").unwrap();
        write_all_synced(&mut file, b"second").unwrap();

        assert_eq!(name, "x-1.jpg");
        assert_eq!(fs::read(dir.path().join("x.jpg")).unwrap(), b"first");
        assert_eq!(fs::read(dir.path().join("x-1.jpg")).unwrap(), b"second");
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.jpg");
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
