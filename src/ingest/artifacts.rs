//! Filesystem stages shared by uploads and provisioning.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::database::models::AccountId;
use crate::error::IngestError;
use crate::ingest::stage::{PipelineRun, StageOutcome};
use crate::ingest::storage::{create_unique, remove_if_exists, write_all_synced, StorageLayout};
use crate::media::thumbnail::{derive_thumbnail, ThumbnailSpec};
use crate::utils::config::ThumbnailPolicy;

/// Writes `bytes` into the account directory under `wanted` (or a suffixed
/// variant of it). The file is tracked before the first byte is written.
pub fn store_original(
    run: &mut PipelineRun<'_>,
    layout: &StorageLayout,
    account: AccountId,
    wanted: &str,
    bytes: &[u8],
) -> Result<(PathBuf, String), IngestError> {
    let dir = layout.ensure_account_dir(account)?;
    let (mut file, filename) = create_unique(&dir, wanted)?;

    let path = dir.join(&filename);
    run.track(&path);
    write_all_synced(&mut file, bytes)?;
    Ok((path, filename))
}

/// Derives the thumbnail for a stored original. Failure is never fatal: the
/// value is the public path to store, decided by `policy` when thumbnailing
/// failed.
pub fn thumbnail_stage(
    run: &mut PipelineRun<'_>,
    layout: &StorageLayout,
    spec: ThumbnailSpec,
    policy: ThumbnailPolicy,
    account: AccountId,
    source: &Path,
    filename: &str,
) -> StageOutcome<Option<String>> {
    let target = layout.thumbnail_path(account, filename);
    run.track(&target);

    match derive_thumbnail(source, &target, spec) {
        Ok(()) => StageOutcome::Ok(Some(layout.public_thumbnail(account, filename))),
        Err(e) => {
            // Partial output is never kept.
            if let Err(cleanup) = remove_if_exists(&target) {
                warn!(path = %target.display(), "Failed to remove partial thumbnail: {}", cleanup);
            }
            let value = match policy {
                ThumbnailPolicy::Omit => None,
                ThumbnailPolicy::Record => Some(layout.public_thumbnail(account, filename)),
            };
            StageOutcome::Degraded { value, reason: e.to_string() }
        }
    }
}
