use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use anyhow::{Result, Context};
use chrono::{NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::database::models::{
    AccountId, Category, CategoryId, ImageId, NewImage, StoredImage, WriteOutcome,
};
use crate::database::schema::SCHEMA;
use crate::media::exif::CaptureMetadata;

const CAPTURE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Where the store lives. Every request opens its own connection from here.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Creates the schema if needed and switches the file to WAL so
    /// concurrent requests do not serialize on readers.
    pub fn initialize(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let db = Self { path: path.to_path_buf(), busy_timeout };
        let conn = db.connect()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<ImageStore> {
        Ok(ImageStore { conn: self.connect()? })
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("Failed to open database {:?}", self.path))?;
        conn.busy_timeout(self.busy_timeout).context("Failed to set busy timeout")?;
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;
        Ok(conn)
    }
}

pub struct ImageStore {
    conn: Connection,
}

impl ImageStore {
    /// Exact-name category visible to `account`. An account-owned category
    /// shadows a global one with the same name.
    pub fn find_visible_category(&self, name: &str, account: AccountId) -> Result<Option<Category>> {
        self.conn
            .query_row(
                "SELECT id, name, user_id FROM categories
                 WHERE name = ?1 AND (user_id IS NULL OR user_id = ?2)
                 ORDER BY user_id IS NULL
                 LIMIT 1",
                params![name, account],
                category_from_row,
            )
            .optional()
            .context("Failed to look up category")
    }

    pub fn find_global_category(&self, name: &str) -> Result<Option<Category>> {
        self.conn
            .query_row(
                "SELECT id, name, user_id FROM categories WHERE name = ?1 AND user_id IS NULL",
                params![name],
                category_from_row,
            )
            .optional()
            .context("Failed to look up global category")
    }

    /// Used by setup tooling; the pipeline itself only reads categories.
    pub fn insert_category(&self, name: &str, owner: Option<AccountId>) -> Result<CategoryId> {
        self.conn
            .execute(
                "INSERT INTO categories (user_id, name, is_default) VALUES (?1, ?2, ?3)",
                params![owner, name, owner.is_none()],
            )
            .with_context(|| format!("Failed to insert category '{}'", name))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_images(&self, account: AccountId) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM images WHERE user_id = ?1",
                params![account],
                |row| row.get(0),
            )
            .context("Failed to count images")
    }

    /// Writes the image row and, if given, its capture metadata in one
    /// transaction. The capture insert runs inside a savepoint: if it fails
    /// only the savepoint is rolled back and the image row still commits.
    pub fn write_image(&mut self, image: &NewImage, capture: Option<&CaptureMetadata>) -> Result<WriteOutcome> {
        let mut tx = self.conn.transaction().context("Failed to begin transaction")?;

        tx.execute(
            "INSERT INTO images (
                user_id, category_id, filename, filepath, thumbnail_path,
                file_size, mime_type, width, height, ai_description, ai_metadata, upload_time
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                image.owner,
                image.category_id,
                image.filename,
                image.filepath,
                image.thumbnail_path,
                image.file_size as i64,
                image.media_type,
                image.width,
                image.height,
                image.description,
                image.metadata.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert image")?;
        let image_id = tx.last_insert_rowid();

        let mut capture_saved = false;
        if let Some(meta) = capture {
            let sp = tx.savepoint().context("Failed to open capture savepoint")?;
            match insert_capture(&sp, image_id, meta) {
                Ok(()) => {
                    sp.commit().context("Failed to release capture savepoint")?;
                    capture_saved = true;
                }
                Err(e) => warn!(image_id, "Failed to save capture metadata: {:#}", e),
            }
        }

        tx.commit().context("Failed to commit transaction")?;
        debug!(image_id, capture_saved, "Image record committed");
        Ok(WriteOutcome { image_id, capture_saved })
    }

    pub fn find_image(&self, id: ImageId) -> Result<Option<StoredImage>> {
        self.conn
            .query_row(
                "SELECT i.id, i.user_id, i.category_id, c.name, i.filename, i.filepath,
                        i.thumbnail_path, i.file_size, i.mime_type, i.width, i.height,
                        i.ai_description, i.ai_metadata, i.upload_time
                 FROM images i
                 LEFT JOIN categories c ON i.category_id = c.id
                 WHERE i.id = ?1",
                params![id],
                image_from_row,
            )
            .optional()
            .context("Failed to load image")
    }

    pub fn find_capture(&self, image_id: ImageId) -> Result<Option<CaptureMetadata>> {
        self.conn
            .query_row(
                "SELECT camera_make, camera_model, datetime_original, exposure_time, f_number,
                        iso, focal_length, gps_latitude, gps_longitude, orientation
                 FROM exif_data WHERE image_id = ?1",
                params![image_id],
                |row| {
                    let captured_at: Option<String> = row.get(2)?;
                    Ok(CaptureMetadata {
                        camera_make: row.get(0)?,
                        camera_model: row.get(1)?,
                        captured_at: captured_at.and_then(|s| {
                            NaiveDateTime::parse_from_str(&s, CAPTURE_TIME_FORMAT).ok()
                        }),
                        exposure_time: row.get(3)?,
                        f_number: row.get(4)?,
                        iso: row.get(5)?,
                        focal_length: row.get(6)?,
                        gps_latitude: row.get(7)?,
                        gps_longitude: row.get(8)?,
                        orientation: row.get(9)?,
                    })
                },
            )
            .optional()
            .context("Failed to load capture metadata")
    }

    /// Raw access for maintenance tooling and tests.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn insert_capture(conn: &Connection, image_id: ImageId, meta: &CaptureMetadata) -> Result<()> {
    conn.execute(
        "INSERT INTO exif_data (
            image_id, camera_make, camera_model, datetime_original,
            exposure_time, f_number, iso, focal_length,
            gps_latitude, gps_longitude, orientation
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            image_id,
            meta.camera_make,
            meta.camera_model,
            meta.captured_at.map(|t| t.format(CAPTURE_TIME_FORMAT).to_string()),
            meta.exposure_time,
            meta.f_number,
            meta.iso,
            meta.focal_length,
            meta.gps_latitude,
            meta.gps_longitude,
            meta.orientation,
        ],
    )
    .context("Failed to insert capture metadata")?;
    Ok(())
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category { id: row.get(0)?, name: row.get(1)?, owner: row.get(2)? })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<StoredImage> {
    let metadata: Option<String> = row.get(12)?;
    let file_size: i64 = row.get(7)?;
    Ok(StoredImage {
        id: row.get(0)?,
        owner: row.get(1)?,
        category_id: row.get(2)?,
        category_name: row.get(3)?,
        filename: row.get(4)?,
        filepath: row.get(5)?,
        thumbnail_path: row.get(6)?,
        file_size: file_size.max(0) as u64,
        media_type: row.get(8)?,
        width: row.get(9)?,
        height: row.get(10)?,
        description: row.get(11)?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at: row.get(13)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn temp_database() -> (TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::initialize(&dir.path().join("media.db"), Duration::from_secs(5)).unwrap();
        (dir, db)
    }

    pub(crate) fn sample_image(owner: AccountId, category_id: Option<CategoryId>) -> NewImage {
        NewImage {
            owner,
            category_id,
            filename: "1700000000000-abc.jpg".to_string(),
            filepath: format!("/uploads/user_{owner}/1700000000000-abc.jpg"),
            thumbnail_path: Some(format!("/uploads/user_{owner}/thumbnails/thumb_1700000000000-abc.jpg")),
            file_size: 2048,
            media_type: "image/jpeg".to_string(),
            width: 640,
            height: 480,
            description: "A dog in the park.".to_string(),
            metadata: json!({"final_label": "animal"}),
        }
    }

    fn sample_capture() -> CaptureMetadata {
        CaptureMetadata {
            camera_make: Some("Canon".into()),
            iso: Some(200),
            captured_at: NaiveDateTime::parse_from_str("2023-07-14 08:00:00", CAPTURE_TIME_FORMAT).ok(),
            ..CaptureMetadata::default()
        }
    }

    #[test]
    fn test_write_image_with_capture() -> Result<()> {
        let (_dir, db) = temp_database();
        let mut store = db.open()?;
        let animal = store.insert_category("animal", None)?;

        let capture = sample_capture();
        let outcome = store.write_image(&sample_image(1, Some(animal)), Some(&capture))?;
        assert!(outcome.capture_saved);

        let row = store.find_image(outcome.image_id)?.unwrap();
        assert_eq!(row.category_name.as_deref(), Some("animal"));
        assert_eq!(row.width, 640);
        assert_eq!(row.file_size, 2048);
        assert_eq!(row.metadata["final_label"], "animal");
        assert_eq!(store.find_capture(outcome.image_id)?, Some(capture));
        assert_eq!(store.count_images(1)?, 1);
        assert_eq!(store.count_images(2)?, 0);
        Ok(())
    }

    #[test]
    fn test_capture_failure_keeps_image_row() -> Result<()> {
        let (_dir, db) = temp_database();
        let mut store = db.open()?;
        store.connection().execute_batch(
            "CREATE TRIGGER reject_exif BEFORE INSERT ON exif_data
             BEGIN SELECT RAISE(ABORT, 'exif rejected'); END;",
        )?;

        let outcome = store.write_image(&sample_image(1, None), Some(&sample_capture()))?;
        assert!(!outcome.capture_saved);
        assert!(store.find_image(outcome.image_id)?.is_some());
        assert_eq!(store.find_capture(outcome.image_id)?, None);
        Ok(())
    }

    #[test]
    fn test_image_failure_writes_nothing() -> Result<()> {
        let (_dir, db) = temp_database();
        let mut store = db.open()?;
        store.connection().execute_batch(
            "CREATE TRIGGER reject_images BEFORE INSERT ON images
             BEGIN SELECT RAISE(ABORT, 'images rejected'); END;",
        )?;

        let err = store.write_image(&sample_image(1, None), Some(&sample_capture())).unwrap_err();
        assert!(format!("{:#}", err).contains("images rejected"));
        assert_eq!(store.count_images(1)?, 0);
        let captures: i64 = store.connection().query_row("SELECT COUNT(*) FROM exif_data", [], |r| r.get(0))?;
        assert_eq!(captures, 0);
        Ok(())
    }

    #[test]
    fn test_category_names_unique_per_scope() -> Result<()> {
        let (_dir, db) = temp_database();
        let store = db.open()?;
        store.insert_category("travel", None)?;
        assert!(store.insert_category("travel", None).is_err());

        // Same name in an account scope is allowed, once per account.
        store.insert_category("travel", Some(1))?;
        store.insert_category("travel", Some(2))?;
        assert!(store.insert_category("travel", Some(1)).is_err());
        Ok(())
    }

    #[test]
    fn test_visible_category_prefers_account_scope() -> Result<()> {
        let (_dir, db) = temp_database();
        let store = db.open()?;
        let global = store.insert_category("pets", None)?;
        let mine = store.insert_category("pets", Some(7))?;
        let theirs = store.insert_category("receipts", Some(8))?;

        assert_eq!(store.find_visible_category("pets", 7)?.map(|c| c.id), Some(mine));
        assert_eq!(store.find_visible_category("pets", 9)?.map(|c| c.id), Some(global));
        assert_eq!(store.find_visible_category("receipts", 7)?, None);
        assert_eq!(store.find_visible_category("receipts", 8)?.map(|c| c.id), Some(theirs));
        assert_eq!(store.find_global_category("receipts")?, None);
        Ok(())
    }

    #[test]
    fn test_initialize_twice_is_harmless() -> Result<()> {
        let (dir, db) = temp_database();
        db.open()?.insert_category("other", None)?;
        let again = Database::initialize(&dir.path().join("media.db"), Duration::from_secs(1))?;
        assert!(again.open()?.find_global_category("other")?.is_some());
        Ok(())
    }
}
