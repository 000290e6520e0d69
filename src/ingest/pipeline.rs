use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::database::models::{AccountId, ImageId, NewImage};
use crate::database::repo::Database;
use crate::database::resolver::CategoryResolver;
use crate::error::IngestError;
use crate::ingest::hasher::stored_filename;
use crate::ingest::artifacts::{store_original, thumbnail_stage};
use crate::ingest::stage::{Degradation, PipelineRun, PipelineState, Stage, StageOutcome};
use crate::ingest::storage::StorageLayout;
use crate::media::exif::extract_capture;
use crate::media::mimetype::validate_upload;
use crate::media::thumbnail::{probe_dimensions, Dimensions, ThumbnailSpec};
use crate::ml::classifier::{ClassificationBridge, Classifier};
use crate::utils::config::{IngestConfig, ThumbnailPolicy};
use crate::utils::context::RequestContext;

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub account_id: AccountId,
    /// Client-side file name; only its extension is used.
    pub original_name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub id: ImageId,
    pub filename: String,
    pub category: String,
    pub description: String,
    pub filepath: String,
    pub thumbnail_path: Option<String>,
    pub width: u32,
    pub height: u32,
    pub capture_saved: bool,
    pub degraded: Vec<Degradation>,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_upload_bytes: u64,
    pub thumbnail: ThumbnailSpec,
    pub thumbnail_policy: ThumbnailPolicy,
    pub request_timeout: Option<Duration>,
}

impl From<&IngestConfig> for UploadSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            thumbnail: ThumbnailSpec::square(config.thumbnail_size),
            thumbnail_policy: config.thumbnail_policy,
            request_timeout: config.request_timeout,
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

struct DerivedArtifacts {
    source: PathBuf,
    filename: String,
    thumbnail_path: Option<String>,
    dims: Dimensions,
}

/// Stores one uploaded image and everything derived from it, or nothing.
pub struct UploadPipeline {
    layout: StorageLayout,
    database: Database,
    bridge: ClassificationBridge,
    resolver: CategoryResolver,
    settings: UploadSettings,
}

impl UploadPipeline {
    pub fn new(
        layout: StorageLayout,
        database: Database,
        classifier: Arc<dyn Classifier>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            layout,
            database,
            bridge: ClassificationBridge::new(classifier),
            resolver: CategoryResolver::new(),
            settings,
        }
    }

    pub fn from_config(config: &IngestConfig, database: Database, classifier: Arc<dyn Classifier>) -> Self {
        Self::new(
            StorageLayout::new(&config.storage_root, config.public_prefix.clone()),
            database,
            classifier,
            UploadSettings::from(config),
        )
    }

    pub fn upload(&self, request: UploadRequest) -> Result<UploadedImage, IngestError> {
        let ctx = RequestContext::new(self.settings.request_timeout);
        self.upload_with(request, &ctx)
    }

    /// Runs the pipeline under a caller-supplied context, so the caller can
    /// cancel it from another thread.
    pub fn upload_with(&self, request: UploadRequest, ctx: &RequestContext) -> Result<UploadedImage, IngestError> {
        let account = request.account_id;
        let extension = validate_upload(
            &request.original_name,
            &request.media_type,
            &request.bytes,
            self.settings.max_upload_bytes,
        )?;
        ctx.checkpoint()?;

        let mut run = PipelineRun::new(ctx);
        let DerivedArtifacts { source, filename, thumbnail_path, dims } =
            self.derive_artifacts(&mut run, account, &request.bytes, &extension)?;

        let capture = match extract_capture(&request.bytes) {
            Ok(meta) => StageOutcome::Ok(meta),
            Err(e) => StageOutcome::Degraded { value: None, reason: e.to_string() },
        };
        let capture = run.settle(Stage::CaptureMetadata, capture)?;

        run.checkpoint(Stage::Classification)?;
        let classified = self.bridge.classify(&source, ctx);
        let classification = run.settle(Stage::Classification, classified)?;
        run.advance(PipelineState::Classified);

        run.checkpoint(Stage::CategoryResolution)?;
        let opened = self.database.open().map_err(IngestError::from);
        let mut store = run.settle(Stage::CategoryResolution, StageOutcome::from(opened))?;
        let resolved = self.resolver.resolve(&store, &classification.label, account);
        let category = run.settle(Stage::CategoryResolution, StageOutcome::from(resolved))?;
        run.advance(PipelineState::CategoryResolved);

        run.checkpoint(Stage::Persistence)?;
        let record = NewImage {
            owner: account,
            category_id: Some(category.id),
            filename: filename.clone(),
            filepath: self.layout.public_original(account, &filename),
            thumbnail_path,
            file_size: request.bytes.len() as u64,
            media_type: request.media_type.trim().to_ascii_lowercase(),
            width: dims.width,
            height: dims.height,
            description: classification.description,
            metadata: classification.metadata,
        };
        let written = store.write_image(&record, capture.as_ref()).map_err(IngestError::from);
        let written = run.settle(Stage::Persistence, StageOutcome::from(written))?;
        let degraded = run.finish();

        info!(
            account_id = account,
            image_id = written.image_id,
            category = %category.name,
            degraded = degraded.len(),
            "Upload persisted"
        );

        Ok(UploadedImage {
            id: written.image_id,
            filename,
            category: category.name,
            description: record.description,
            filepath: record.filepath,
            thumbnail_path: record.thumbnail_path,
            width: dims.width,
            height: dims.height,
            capture_saved: written.capture_saved,
            degraded,
        })
    }

    /// Stores the original and its thumbnail, then probes dimensions. The
    /// probe runs once the artifacts exist, so its failure aborts from
    /// `ArtifactsDerived`.
    fn derive_artifacts(
        &self,
        run: &mut PipelineRun<'_>,
        account: AccountId,
        bytes: &[u8],
        extension: &str,
    ) -> Result<DerivedArtifacts, IngestError> {
        let wanted = stored_filename(bytes, extension, Utc::now().timestamp_millis());
        let stored = StageOutcome::from(store_original(run, &self.layout, account, &wanted, bytes));
        let (source, filename) = run.settle(Stage::StoreSource, stored)?;
        info!(account_id = account, path = %source.display(), "Stored upload");

        let thumbnail = thumbnail_stage(
            run,
            &self.layout,
            self.settings.thumbnail,
            self.settings.thumbnail_policy,
            account,
            &source,
            &filename,
        );
        let thumbnail_path = run.settle(Stage::Thumbnail, thumbnail)?;
        run.advance(PipelineState::ArtifactsDerived);

        run.checkpoint(Stage::Dimensions)?;
        let probed = probe_dimensions(&source).map_err(|e| IngestError::Media(e.to_string()));
        let dims = run.settle(Stage::Dimensions, StageOutcome::from(probed))?;

        Ok(DerivedArtifacts { source, filename, thumbnail_path, dims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repo::tests::temp_database;
    use crate::media::exif::tests::jpeg_with_exif;
    use crate::media::thumbnail::tests::write_jpeg;
    use crate::ml::classifier::tests::StubClassifier;
    use crate::ml::classifier::{ClassifyError, WorkerOutput, CATCH_ALL_CATEGORY, DEFAULT_DESCRIPTION};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _db_dir: TempDir,
        storage: TempDir,
        database: Database,
    }

    impl Fixture {
        fn new(categories: &[&str]) -> Self {
            let (db_dir, database) = temp_database();
            let store = database.open().unwrap();
            for name in categories {
                store.insert_category(name, None).unwrap();
            }
            Self { _db_dir: db_dir, storage: tempfile::tempdir().unwrap(), database }
        }

        fn pipeline(&self, classifier: StubClassifier) -> UploadPipeline {
            UploadPipeline::new(
                StorageLayout::new(self.storage.path(), "/uploads"),
                self.database.clone(),
                Arc::new(classifier),
                UploadSettings::default(),
            )
        }

        fn account_files(&self, account: AccountId) -> Vec<String> {
            let dir = self.storage.path().join(format!("user_{account}"));
            let mut names: Vec<String> = walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().strip_prefix(&dir).unwrap().to_string_lossy().to_string())
                .collect();
            names.sort();
            names
        }
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.jpg");
        write_jpeg(&path, width, height);
        fs::read(path).unwrap()
    }

    fn request(account: AccountId, bytes: Vec<u8>) -> UploadRequest {
        UploadRequest {
            account_id: account,
            original_name: "IMG_0001.JPG".to_string(),
            media_type: "image/jpeg".to_string(),
            bytes,
        }
    }

    #[test]
    fn test_upload_persists_all_artifacts() {
        let fx = Fixture::new(&["other", "animal"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("animal", "A sleepy cat."));

        let uploaded = pipeline.upload(request(1, jpeg_bytes(640, 480))).unwrap();
        assert_eq!(uploaded.category, "animal");
        assert_eq!(uploaded.description, "A sleepy cat.");
        assert_eq!((uploaded.width, uploaded.height), (640, 480));
        assert!(uploaded.degraded.is_empty());
        assert!(uploaded.filename.ends_with(".jpg"));
        assert_eq!(uploaded.filepath, format!("/uploads/user_1/{}", uploaded.filename));
        assert_eq!(
            uploaded.thumbnail_path.as_deref(),
            Some(format!("/uploads/user_1/thumbnails/thumb_{}", uploaded.filename).as_str())
        );

        assert_eq!(
            fx.account_files(1),
            vec![uploaded.filename.clone(), format!("thumbnails/thumb_{}", uploaded.filename)]
        );

        let row = fx.database.open().unwrap().find_image(uploaded.id).unwrap().unwrap();
        assert_eq!(row.category_name.as_deref(), Some("animal"));
        assert_eq!(row.media_type, "image/jpeg");
    }

    #[test]
    fn test_capture_metadata_is_saved_when_present() {
        let fx = Fixture::new(&["other"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("other", "Something."));

        // Splice the EXIF segment in front of a decodable JPEG body.
        let mut bytes = jpeg_with_exif();
        bytes.truncate(bytes.len() - 2);
        bytes.extend_from_slice(&jpeg_bytes(32, 32)[2..]);

        let uploaded = pipeline.upload(request(2, bytes)).unwrap();
        assert!(uploaded.capture_saved);
        let capture = fx.database.open().unwrap().find_capture(uploaded.id).unwrap().unwrap();
        assert_eq!(capture.camera_model.as_deref(), Some("EOS 5D"));
    }

    #[test]
    fn test_worker_failure_degrades_to_catch_all() {
        let fx = Fixture::new(&["other", "animal"]);
        let pipeline = fx.pipeline(StubClassifier::replaying(vec![Err(ClassifyError::NonZeroExit {
            code: Some(1),
            stderr: "CUDA out of memory".into(),
        })]));

        let uploaded = pipeline.upload(request(1, jpeg_bytes(64, 64))).unwrap();
        assert_eq!(uploaded.category, CATCH_ALL_CATEGORY);
        assert_eq!(uploaded.description, DEFAULT_DESCRIPTION);
        assert_eq!(uploaded.degraded.len(), 1);
        assert_eq!(uploaded.degraded[0].stage, Stage::Classification);

        let row = fx.database.open().unwrap().find_image(uploaded.id).unwrap().unwrap();
        assert!(row.metadata["error"].as_str().unwrap().contains("CUDA out of memory"));
    }

    #[test]
    fn test_thumbnail_failure_still_persists() {
        let fx = Fixture::new(&["other"]);
        fs::create_dir_all(fx.storage.path().join("user_1")).unwrap();
        fs::write(fx.storage.path().join("user_1/thumbnails"), b"not a directory").unwrap();

        let mut settings = UploadSettings::default();
        settings.thumbnail_policy = ThumbnailPolicy::Record;
        let pipeline = UploadPipeline::new(
            StorageLayout::new(fx.storage.path(), "/uploads"),
            fx.database.clone(),
            Arc::new(StubClassifier::labelled("other", "x")),
            settings,
        );

        let uploaded = pipeline.upload(request(1, jpeg_bytes(64, 64))).unwrap();
        assert_eq!(uploaded.degraded.len(), 1);
        assert_eq!(uploaded.degraded[0].stage, Stage::Thumbnail);
        let recorded = uploaded.thumbnail_path.unwrap();
        assert_eq!(recorded, format!("/uploads/user_1/thumbnails/thumb_{}", uploaded.filename));
        assert!(fx.storage.path().join("user_1").join(&uploaded.filename).is_file());
    }

    #[test]
    fn test_validation_failure_touches_nothing() {
        let fx = Fixture::new(&["other"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("other", "x"));

        let mut req = request(1, jpeg_bytes(8, 8));
        req.original_name = "scan.png".into();
        let err = pipeline.upload(req).unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert!(!fx.storage.path().join("user_1").exists());
    }

    #[test]
    fn test_undecodable_upload_aborts_and_cleans_up() {
        let fx = Fixture::new(&["other"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("other", "x"));

        let garbage = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x02, 0xDE, 0xAD, 0xBE, 0xEF];
        let err = pipeline.upload(request(1, garbage)).unwrap_err();
        assert!(matches!(err, IngestError::Media(_)));
        assert!(fx.account_files(1).is_empty());
        assert_eq!(fx.database.open().unwrap().count_images(1).unwrap(), 0);
    }

    #[test]
    fn test_dimension_probe_runs_after_artifacts_derived() {
        let fx = Fixture::new(&["other"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("other", "x"));
        let ctx = RequestContext::unbounded();

        let mut run = PipelineRun::new(&ctx);
        let derived = pipeline.derive_artifacts(&mut run, 1, &jpeg_bytes(40, 30), "jpg").unwrap();
        assert_eq!(run.state(), PipelineState::ArtifactsDerived);
        assert_eq!((derived.dims.width, derived.dims.height), (40, 30));
        run.finish();

        let mut run = PipelineRun::new(&ctx);
        let garbage = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x02, 0xDE, 0xAD, 0xBE, 0xEF];
        let err = pipeline.derive_artifacts(&mut run, 2, &garbage, "jpg").err().unwrap();
        assert!(matches!(err, IngestError::Media(_)));
        assert_eq!(run.state(), PipelineState::Aborted);
        // The thumbnail failure was recorded before the probe aborted the run.
        assert_eq!(run.degraded()[0].stage, Stage::Thumbnail);
        assert!(fx.account_files(2).is_empty());
    }

    #[test]
    fn test_missing_catch_all_aborts_and_cleans_up() {
        let fx = Fixture::new(&["animal"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("spaceship", "x"));

        let err = pipeline.upload(request(1, jpeg_bytes(64, 64))).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(_)));
        assert!(fx.account_files(1).is_empty());
    }

    #[test]
    fn test_persistence_failure_aborts_and_cleans_up() {
        let fx = Fixture::new(&["other"]);
        fx.database
            .open()
            .unwrap()
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_images BEFORE INSERT ON images
                 BEGIN SELECT RAISE(ABORT, 'disk quota'); END;",
            )
            .unwrap();
        let pipeline = fx.pipeline(StubClassifier::labelled("other", "x"));

        let err = pipeline.upload(request(1, jpeg_bytes(64, 64))).unwrap_err();
        assert!(matches!(err, IngestError::Persistence(_)));
        assert!(err.to_string().contains("disk quota"));
        assert!(fx.account_files(1).is_empty());
    }

    struct CancellingClassifier;

    impl Classifier for CancellingClassifier {
        fn classify(&self, _path: &Path, ctx: &RequestContext) -> Result<WorkerOutput, ClassifyError> {
            ctx.cancel();
            Err(ClassifyError::Cancelled)
        }
    }

    #[test]
    fn test_cancellation_mid_request_compensates() {
        let fx = Fixture::new(&["other"]);
        let pipeline = UploadPipeline::new(
            StorageLayout::new(fx.storage.path(), "/uploads"),
            fx.database.clone(),
            Arc::new(CancellingClassifier),
            UploadSettings::default(),
        );

        let ctx = RequestContext::unbounded();
        let err = pipeline.upload_with(request(1, jpeg_bytes(64, 64)), &ctx).unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        assert!(fx.account_files(1).is_empty());
        assert_eq!(fx.database.open().unwrap().count_images(1).unwrap(), 0);
    }

    #[test]
    fn test_cancelled_request_writes_nothing() {
        let fx = Fixture::new(&["other"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("other", "x"));

        let ctx = RequestContext::unbounded();
        ctx.cancel();
        let err = pipeline.upload_with(request(1, jpeg_bytes(16, 16)), &ctx).unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        assert!(fx.account_files(1).is_empty());
    }

    #[test]
    fn test_expired_deadline_is_reported() {
        let fx = Fixture::new(&["other"]);
        let pipeline = fx.pipeline(StubClassifier::labelled("other", "x"));

        let ctx = RequestContext::new(Some(Duration::ZERO));
        let err = pipeline.upload_with(request(1, jpeg_bytes(16, 16)), &ctx).unwrap_err();
        assert!(matches!(err, IngestError::DeadlineExceeded));
    }
}
