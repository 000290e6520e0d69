//! Example images copied into every new account.
//!
//! Runs the upload stages minus classification: the category and caption of
//! each asset are fixed. Every asset is attempted independently; a failing
//! asset is compensated and skipped, and the batch never fails as a whole.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::database::models::{AccountId, ImageId, NewImage};
use crate::database::repo::Database;
use crate::database::resolver::CategoryResolver;
use crate::error::IngestError;
use crate::ingest::artifacts::{store_original, thumbnail_stage};
use crate::ingest::stage::{PipelineRun, PipelineState, Stage, StageOutcome};
use crate::ingest::storage::StorageLayout;
use crate::media::mimetype::{detect_mimetype, OCTET_STREAM};
use crate::media::thumbnail::{probe_dimensions, ThumbnailSpec, FALLBACK_DIMENSIONS};
use crate::ml::classifier::Classification;
use crate::utils::config::{IngestConfig, ThumbnailPolicy};
use crate::utils::context::RequestContext;

const FALLBACK_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultAsset {
    /// File name inside the template directory.
    pub filename: &'static str,
    pub category: &'static str,
    pub caption: &'static str,
}

pub const DEFAULT_ASSETS: &[DefaultAsset] = &[
    DefaultAsset { filename: "People.jpg", category: "people", caption: "Sample portrait photo" },
    DefaultAsset { filename: "Animals.jpg", category: "animal", caption: "Sample animal photo" },
    DefaultAsset { filename: "Food.jpg", category: "food", caption: "Sample food photo" },
    DefaultAsset { filename: "Natural.jpg", category: "nature", caption: "Sample landscape photo" },
    DefaultAsset { filename: "TextScreenshot.jpg", category: "text_screenshot", caption: "Sample text screenshot" },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedAsset {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub persisted: Vec<ImageId>,
    pub skipped: Vec<SkippedAsset>,
}

pub struct DefaultProvisioner {
    layout: StorageLayout,
    database: Database,
    resolver: CategoryResolver,
    template_dir: PathBuf,
    thumbnail: ThumbnailSpec,
    thumbnail_policy: ThumbnailPolicy,
    in_flight: Mutex<HashSet<AccountId>>,
}

impl DefaultProvisioner {
    pub fn new(layout: StorageLayout, database: Database, template_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            database,
            resolver: CategoryResolver::new(),
            template_dir: template_dir.into(),
            thumbnail: ThumbnailSpec::default(),
            thumbnail_policy: ThumbnailPolicy::Omit,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &IngestConfig, database: Database) -> Self {
        let mut provisioner = Self::new(
            StorageLayout::new(&config.storage_root, config.public_prefix.clone()),
            database,
            &config.template_dir,
        );
        provisioner.thumbnail = ThumbnailSpec::square(config.thumbnail_size);
        provisioner.thumbnail_policy = config.thumbnail_policy;
        provisioner
    }

    /// Provisions only when the account has no images yet. Returns `None`
    /// when it already has some, or when another call in this process is
    /// already provisioning it.
    pub fn provision_if_empty(&self, account: AccountId) -> Result<Option<ProvisionReport>, IngestError> {
        let Some(_guard) = AccountGuard::acquire(&self.in_flight, account) else {
            info!(account_id = account, "Provisioning already running for account");
            return Ok(None);
        };

        let existing = self.database.open()?.count_images(account)?;
        if existing > 0 {
            info!(account_id = account, existing, "Account already has images, not provisioning");
            return Ok(None);
        }

        Ok(Some(self.provision(account)))
    }

    pub fn provision(&self, account: AccountId) -> ProvisionReport {
        self.provision_with(account, &RequestContext::unbounded())
    }

    /// Attempts every asset in order. Stops early only if `ctx` is cancelled
    /// or expires; the remaining assets are reported as skipped.
    pub fn provision_with(&self, account: AccountId, ctx: &RequestContext) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        for (i, asset) in DEFAULT_ASSETS.iter().enumerate() {
            if let Err(e) = ctx.checkpoint() {
                warn!(account_id = account, "Provisioning stopped: {}", e);
                report.skipped.extend(DEFAULT_ASSETS[i..].iter().map(|a| SkippedAsset {
                    filename: a.filename.to_string(),
                    reason: e.to_string(),
                }));
                break;
            }

            match self.provision_asset(account, asset, ctx) {
                Ok(Some(id)) => report.persisted.push(id),
                Ok(None) => report.skipped.push(SkippedAsset {
                    filename: asset.filename.to_string(),
                    reason: "template missing".to_string(),
                }),
                Err(e) => {
                    error!(account_id = account, asset = asset.filename, "Failed to provision asset: {}", e);
                    report.skipped.push(SkippedAsset {
                        filename: asset.filename.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            account_id = account,
            persisted = report.persisted.len(),
            skipped = report.skipped.len(),
            "Provisioning finished"
        );
        report
    }

    /// `Ok(None)` when the template file does not exist.
    fn provision_asset(
        &self,
        account: AccountId,
        asset: &DefaultAsset,
        ctx: &RequestContext,
    ) -> Result<Option<ImageId>, IngestError> {
        let template = self.template_dir.join(asset.filename);
        let bytes = match fs::read(&template) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(template = %template.display(), "Default asset template missing, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut run = PipelineRun::new(ctx);

        let copied = StageOutcome::from(store_original(&mut run, &self.layout, account, asset.filename, &bytes));
        let (source, filename) = run.settle(Stage::StoreSource, copied)?;

        let thumbnail = thumbnail_stage(
            &mut run,
            &self.layout,
            self.thumbnail,
            self.thumbnail_policy,
            account,
            &source,
            &filename,
        );
        let thumbnail_path = run.settle(Stage::Thumbnail, thumbnail)?;
        run.advance(PipelineState::ArtifactsDerived);

        let dims = match probe_dimensions(&source) {
            Ok(d) => StageOutcome::Ok(d),
            Err(e) => StageOutcome::Degraded { value: FALLBACK_DIMENSIONS, reason: e.to_string() },
        };
        let dims = run.settle(Stage::Dimensions, dims)?;

        let classification = Classification::default_asset(asset.category, asset.caption);
        run.advance(PipelineState::Classified);

        let opened = self.database.open().map_err(IngestError::from);
        let mut store = run.settle(Stage::CategoryResolution, StageOutcome::from(opened))?;
        let resolved = self.resolver.resolve(&store, &classification.label, account);
        let category = run.settle(Stage::CategoryResolution, StageOutcome::from(resolved))?;
        run.advance(PipelineState::CategoryResolved);

        let record = NewImage {
            owner: account,
            category_id: Some(category.id),
            filepath: self.layout.public_original(account, &filename),
            filename,
            thumbnail_path,
            file_size: bytes.len() as u64,
            media_type: sniff_media_type(&source),
            width: dims.width,
            height: dims.height,
            description: classification.description,
            metadata: classification.metadata,
        };
        let written = store.write_image(&record, None).map_err(IngestError::from);
        let written = run.settle(Stage::Persistence, StageOutcome::from(written))?;
        run.finish();

        info!(account_id = account, image_id = written.image_id, asset = asset.filename, "Provisioned default asset");
        Ok(Some(written.image_id))
    }
}

fn sniff_media_type(path: &Path) -> String {
    match detect_mimetype(path) {
        Ok(mime) if mime != OCTET_STREAM => mime,
        Ok(_) => FALLBACK_MEDIA_TYPE.to_string(),
        Err(e) => {
            warn!(path = %path.display(), "Could not sniff media type: {:#}", e);
            FALLBACK_MEDIA_TYPE.to_string()
        }
    }
}

/// Marks an account as being provisioned for as long as it lives.
struct AccountGuard<'a> {
    in_flight: &'a Mutex<HashSet<AccountId>>,
    account: AccountId,
}

impl<'a> AccountGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<AccountId>>, account: AccountId) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(account).then(|| Self { in_flight, account })
    }
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repo::tests::temp_database;
    use crate::media::thumbnail::tests::write_jpeg;
    use tempfile::TempDir;

    struct Fixture {
        _db_dir: TempDir,
        templates: TempDir,
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
            Self {
                _db_dir: db_dir,
                templates: tempfile::tempdir().unwrap(),
                storage: tempfile::tempdir().unwrap(),
                database,
            }
        }

        fn write_templates(&self, names: &[&str]) {
            for name in names {
                write_jpeg(&self.templates.path().join(name), 120, 90);
            }
        }

        fn provisioner(&self) -> DefaultProvisioner {
            DefaultProvisioner::new(
                StorageLayout::new(self.storage.path(), "/uploads"),
                self.database.clone(),
                self.templates.path(),
            )
        }
    }

    const ALL_CATEGORIES: &[&str] = &["other", "people", "animal", "food", "nature", "text_screenshot"];

    #[test]
    fn test_missing_template_is_skipped() {
        let fx = Fixture::new(ALL_CATEGORIES);
        fx.write_templates(&["People.jpg", "Animals.jpg", "Natural.jpg", "TextScreenshot.jpg"]);

        let report = fx.provisioner().provision(7);
        assert_eq!(report.persisted.len(), 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].filename, "Food.jpg");
        assert_eq!(fx.database.open().unwrap().count_images(7).unwrap(), 4);
    }

    #[test]
    fn test_default_asset_row_shape() {
        let fx = Fixture::new(ALL_CATEGORIES);
        fx.write_templates(&["Animals.jpg"]);

        let report = fx.provisioner().provision(3);
        let row = fx.database.open().unwrap().find_image(report.persisted[0]).unwrap().unwrap();
        assert_eq!(row.filename, "Animals.jpg");
        assert_eq!(row.filepath, "/uploads/user_3/Animals.jpg");
        assert_eq!(row.thumbnail_path.as_deref(), Some("/uploads/user_3/thumbnails/thumb_Animals.jpg"));
        assert_eq!(row.category_name.as_deref(), Some("animal"));
        assert_eq!(row.description.as_deref(), Some("Sample animal photo"));
        assert_eq!(row.media_type, "image/jpeg");
        assert_eq!((row.width, row.height), (120, 90));
        assert_eq!(row.metadata["is_default"], true);
        assert!(fx.storage.path().join("user_3/thumbnails/thumb_Animals.jpg").is_file());
    }

    #[test]
    fn test_unknown_category_falls_back_to_catch_all() {
        let fx = Fixture::new(&["other"]);
        fx.write_templates(&["People.jpg"]);

        let report = fx.provisioner().provision(1);
        let row = fx.database.open().unwrap().find_image(report.persisted[0]).unwrap().unwrap();
        assert_eq!(row.category_name.as_deref(), Some("other"));
    }

    #[test]
    fn test_unresolvable_asset_is_compensated() {
        let fx = Fixture::new(&["people"]);
        fx.write_templates(&["People.jpg", "Food.jpg"]);

        let report = fx.provisioner().provision(2);
        assert_eq!(report.persisted.len(), 1);
        assert_eq!(report.skipped.len(), 4);
        assert!(fx.storage.path().join("user_2/People.jpg").is_file());
        assert!(!fx.storage.path().join("user_2/Food.jpg").exists());
        assert!(!fx.storage.path().join("user_2/thumbnails/thumb_Food.jpg").exists());
    }

    #[test]
    fn test_undecodable_template_uses_fallback_dimensions() {
        let fx = Fixture::new(ALL_CATEGORIES);
        fs::write(fx.templates.path().join("People.jpg"), [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x02, 0x13, 0x37]).unwrap();

        let report = fx.provisioner().provision(5);
        let row = fx.database.open().unwrap().find_image(report.persisted[0]).unwrap().unwrap();
        assert_eq!((row.width, row.height), (800, 600));
        assert_eq!(row.thumbnail_path, None);
    }

    #[test]
    fn test_provision_if_empty_respects_existing_images() {
        let fx = Fixture::new(ALL_CATEGORIES);
        fx.write_templates(&["People.jpg"]);
        let provisioner = fx.provisioner();

        let first = provisioner.provision_if_empty(9).unwrap();
        assert_eq!(first.map(|r| r.persisted.len()), Some(1));
        assert_eq!(provisioner.provision_if_empty(9).unwrap(), None);
        assert_eq!(fx.database.open().unwrap().count_images(9).unwrap(), 1);
    }

    #[test]
    fn test_guard_blocks_concurrent_provisioning_of_same_account() {
        let in_flight = Mutex::new(HashSet::new());
        let held = AccountGuard::acquire(&in_flight, 4).unwrap();
        assert!(AccountGuard::acquire(&in_flight, 4).is_none());
        assert!(AccountGuard::acquire(&in_flight, 5).is_some());
        drop(held);
        assert!(AccountGuard::acquire(&in_flight, 4).is_some());
    }

    #[test]
    fn test_cancelled_provisioning_skips_remaining() {
        let fx = Fixture::new(ALL_CATEGORIES);
        fx.write_templates(&["People.jpg", "Animals.jpg"]);
        let ctx = RequestContext::unbounded();
        ctx.cancel();

        let report = fx.provisioner().provision_with(6, &ctx);
        assert!(report.persisted.is_empty());
        assert_eq!(report.skipped.len(), DEFAULT_ASSETS.len());
    }
}
