use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use walkdir::WalkDir;
use anyhow::{Result, Context, anyhow};
use tracing::{info, warn};

/// What to store as the thumbnail path when thumbnailing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailPolicy {
    /// Store no thumbnail path.
    Omit,
    /// Store the intended path even though no file backs it.
    Record,
}

impl FromStr for ThumbnailPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "omit" => Ok(ThumbnailPolicy::Omit),
            "record" => Ok(ThumbnailPolicy::Record),
            other => Err(anyhow!("expected 'omit' or 'record', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub storage_root: PathBuf,
    pub public_prefix: String,
    pub database_path: PathBuf,
    pub template_dir: PathBuf,
    pub classifier_program: String,
    pub classifier_script: PathBuf,
    pub classifier_workers: usize,
    pub classifier_queue: usize,
    pub classifier_timeout: Duration,
    /// `None` disables the whole-request deadline.
    pub request_timeout: Option<Duration>,
    pub busy_timeout: Duration,
    pub max_upload_bytes: u64,
    pub thumbnail_size: u32,
    pub thumbnail_policy: ThumbnailPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("uploads"),
            public_prefix: "/uploads".to_string(),
            database_path: PathBuf::from("media.db"),
            template_dir: PathBuf::from("uploads/defaults"),
            classifier_program: "python3".to_string(),
            classifier_script: PathBuf::from("classify_image.py"),
            classifier_workers: 2,
            classifier_queue: 32,
            classifier_timeout: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(180)),
            busy_timeout: Duration::from_millis(5000),
            max_upload_bytes: 10 * 1024 * 1024,
            thumbnail_size: 300,
            thumbnail_policy: ThumbnailPolicy::Omit,
        }
    }
}

const KEYS: &[&str] = &[
    "STORAGE_ROOT",
    "PUBLIC_PREFIX",
    "DATABASE_PATH",
    "TEMPLATE_DIR",
    "CLASSIFIER_PROGRAM",
    "CLASSIFIER_SCRIPT",
    "CLASSIFIER_WORKERS",
    "CLASSIFIER_QUEUE",
    "CLASSIFIER_TIMEOUT_SECS",
    "REQUEST_TIMEOUT_SECS",
    "DB_BUSY_TIMEOUT_MS",
    "MAX_UPLOAD_BYTES",
    "THUMBNAIL_SIZE",
    "THUMBNAIL_POLICY",
];

impl IngestConfig {
    /// Defaults, then the `.env`-style file (if it exists), then the process environment.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let env_path = env_file.unwrap_or_else(|| Path::new(".env"));
        if env_path.exists() {
            let pairs = read_env_file(env_path)?;
            config.apply_pairs(pairs)?;
            info!("Loaded configuration from {:?}", env_path);
        } else if env_file.is_some() {
            return Err(anyhow!("Config file {:?} does not exist", env_path));
        }

        let from_env = KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)));
        config.apply_pairs(from_env)?;

        Ok(config)
    }

    pub fn apply_pairs<I>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in pairs {
            self.apply(&key, &value)
                .with_context(|| format!("Invalid value for {}: '{}'", key, value))?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "STORAGE_ROOT" => self.storage_root = PathBuf::from(value),
            "PUBLIC_PREFIX" => self.public_prefix = value.trim_end_matches('/').to_string(),
            "DATABASE_PATH" => self.database_path = PathBuf::from(value),
            "TEMPLATE_DIR" => self.template_dir = PathBuf::from(value),
            "CLASSIFIER_PROGRAM" => self.classifier_program = value.to_string(),
            "CLASSIFIER_SCRIPT" => self.classifier_script = PathBuf::from(value),
            "CLASSIFIER_WORKERS" => self.classifier_workers = positive(value)?,
            "CLASSIFIER_QUEUE" => self.classifier_queue = positive(value)?,
            "CLASSIFIER_TIMEOUT_SECS" => {
                self.classifier_timeout = Duration::from_secs(positive(value)?)
            }
            "REQUEST_TIMEOUT_SECS" => {
                let secs: u64 = value.parse()?;
                self.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "DB_BUSY_TIMEOUT_MS" => self.busy_timeout = Duration::from_millis(value.parse()?),
            "MAX_UPLOAD_BYTES" => self.max_upload_bytes = positive(value)?,
            "THUMBNAIL_SIZE" => self.thumbnail_size = positive(value)?,
            "THUMBNAIL_POLICY" => self.thumbnail_policy = value.parse()?,
            _ => warn!("Ignoring unknown configuration key {}", key),
        }
        Ok(())
    }

    /// Keeps the configured worker script if it exists, otherwise searches
    /// nearby directories for a file with the same name.
    pub fn resolve_classifier_script(&mut self) -> Result<()> {
        if self.classifier_script.exists() {
            return Ok(());
        }

        let name = self
            .classifier_script
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Classifier script path has no file name"))?
            .to_string();

        info!("Classifier script not at {:?}. Searching filesystem...", self.classifier_script);
        let found = find_file(&name, 5)?;
        info!("Found classifier script: {:?}", found);
        self.classifier_script = found;
        Ok(())
    }
}

fn positive<T>(value: &str) -> Result<T>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let n: T = value.parse()?;
    if n == T::default() {
        return Err(anyhow!("must be greater than zero"));
    }
    Ok(n)
}

fn find_file(filename: &str, max_depth: usize) -> Result<PathBuf> {
    let root = std::env::current_dir()?;
    let search_roots = std::iter::once(root.as_path()).chain(root.parent());

    for dir in search_roots {
        let found = WalkDir::new(dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name() == filename);

        if let Some(entry) = found {
            return Ok(entry.path().to_path_buf());
        }
    }

    Err(anyhow!("Could not find file '{}' in nearby directories.", filename))
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let reader = BufReader::new(file);

    let mut pairs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(pairs)
}
