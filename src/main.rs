use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use media_ingest::database::{AccountId, Database};
use media_ingest::ingest::{DefaultProvisioner, UploadPipeline, UploadRequest, UploadedImage, DEFAULT_ASSETS};
use media_ingest::media::mimetype::{detect_mimetype, extension_of};
use media_ingest::ml::{ClassifierPool, ProcessClassifier, CATCH_ALL_CATEGORY};
use media_ingest::utils::config::IngestConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// `.env`-style file with configuration overrides
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and the global categories
    Init,
    /// Ingest JPEG files; directories are searched recursively
    Upload {
        #[arg(short, long)]
        account: AccountId,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Copy the default assets into an account that has no images yet
    Provision {
        #[arg(short, long)]
        account: AccountId,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = IngestConfig::load(args.env_file.as_deref())?;
    if let Some(path) = args.db_path {
        config.database_path = path;
    }
    if let Some(root) = args.storage_root {
        config.storage_root = root;
    }

    let database = Database::initialize(&config.database_path, config.busy_timeout)?;
    info!("DB: {:?}", database.path());
    info!("Storage: {:?}", config.storage_root);

    match args.command {
        Command::Init => seed_categories(&database),
        Command::Upload { account, paths } => upload(config, database, account, &paths),
        Command::Provision { account } => provision(&config, database, account),
    }
}

fn seed_categories(database: &Database) -> Result<()> {
    let store = database.open()?;
    let names = std::iter::once(CATCH_ALL_CATEGORY).chain(DEFAULT_ASSETS.iter().map(|a| a.category));

    for name in names {
        if store.find_global_category(name)?.is_none() {
            store.insert_category(name, None)?;
            info!("Created global category '{}'", name);
        }
    }
    Ok(())
}

fn upload(mut config: IngestConfig, database: Database, account: AccountId, inputs: &[PathBuf]) -> Result<()> {
    let files = collect_files(inputs);
    if files.is_empty() {
        warn!("No JPEG files found in {:?}", inputs);
        return Ok(());
    }

    config.resolve_classifier_script()?;
    let worker = ProcessClassifier::script(
        config.classifier_program.clone(),
        &config.classifier_script,
        config.classifier_timeout,
    );
    let pool = Arc::new(ClassifierPool::new(
        Arc::new(worker),
        config.classifier_workers,
        config.classifier_queue,
    ));
    info!("Classifier pool: {} workers", pool.workers());
    let pipeline = UploadPipeline::from_config(&config, database, pool);

    let bar = ProgressBar::new(files.len() as u64);
    bar.set_style(ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")?);

    let failures: usize = files
        .par_iter()
        .map(|path| {
            let failed = match upload_file(&pipeline, account, path) {
                Ok(image) => {
                    info!(
                        "{:?} -> #{} '{}' ({} degraded)",
                        path,
                        image.id,
                        image.category,
                        image.degraded.len()
                    );
                    0usize
                }
                Err(e) => {
                    error!("Failed to upload {:?}: {:#}", path, e);
                    1
                }
            };
            bar.inc(1);
            failed
        })
        .sum();
    bar.finish_and_clear();

    info!("Uploaded {} of {} files", files.len() - failures, files.len());
    Ok(())
}

fn upload_file(pipeline: &UploadPipeline, account: AccountId, path: &Path) -> Result<UploadedImage> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    // No client here to declare a type, so the sniffed one stands in.
    let media_type = detect_mimetype(path)?;
    let original_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let image = pipeline.upload(UploadRequest { account_id: account, original_name, media_type, bytes })?;
    Ok(image)
}

fn collect_files(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            files.extend(
                WalkDir::new(input)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .filter(|e| {
                        let name = e.file_name().to_string_lossy();
                        matches!(extension_of(&name).as_deref(), Some("jpg" | "jpeg"))
                    })
                    .map(|e| e.into_path()),
            );
        } else {
            files.push(input.clone());
        }
    }
    files
}

fn provision(config: &IngestConfig, database: Database, account: AccountId) -> Result<()> {
    let provisioner = DefaultProvisioner::from_config(config, database);

    match provisioner.provision_if_empty(account)? {
        Some(report) => {
            for skipped in &report.skipped {
                warn!("Skipped {}: {}", skipped.filename, skipped.reason);
            }
            info!("Provisioned {} default images for account {}", report.persisted.len(), account);
        }
        None => info!("Account {} already has images, nothing to provision", account),
    }
    Ok(())
}
