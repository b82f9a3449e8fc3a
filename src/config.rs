use crate::runner::Engine;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_UPLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(rename = "maxUploadSize")]
    max_upload_size: Option<usize>,
    #[serde(rename = "strictScripts", default)]
    strict_scripts: bool,
    primary: Option<Engine>,
    fallback: Option<Engine>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Wall-clock limit for a single script run
    pub timeout: Duration,
    /// Largest accepted upload in bytes
    pub max_upload_size: usize,
    /// Reject uploads that the script check flags instead of only warning
    pub strict_scripts: bool,
    pub primary: Engine,
    pub fallback: Engine,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            strict_scripts: false,
            primary: Engine::matlab(),
            fallback: Engine::octave(),
        }
    }
}

impl Config {
    fn from_raw(raw: RawConfig) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            timeout: raw.timeout.unwrap_or(defaults.timeout),
            max_upload_size: raw.max_upload_size.unwrap_or(defaults.max_upload_size),
            strict_scripts: raw.strict_scripts,
            primary: raw.primary.unwrap_or(defaults.primary),
            fallback: raw.fallback.unwrap_or(defaults.fallback),
        };

        if config.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        if config.max_upload_size == 0 {
            bail!("maxUploadSize must be greater than zero");
        }
        for engine in [&config.primary, &config.fallback] {
            if engine.program.trim().is_empty() {
                bail!("Engine {} has an empty program", engine.name);
            }
        }

        Ok(config)
    }

    /// Parse a TOML configuration
    pub fn parse(toml_str: &str) -> Result<Self> {
        Self::from_raw(toml::from_str(toml_str)?)
    }

    /// Load a configuration file by its path
    pub fn load(path: &Path) -> Result<Self> {
        let toml_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&toml_str)
            .with_context(|| format!("Failed to load TOML config file {}", path.display()))
    }
}

/// Where uploads, results and the default database live on disk
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the top-level directories
    pub fn create(&self) -> Result<()> {
        for dir in [self.uploads_root(), self.results_root()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn default_database_url(&self) -> String {
        self.root.join("database.sqlite").to_string_lossy().into_owned()
    }

    fn uploads_root(&self) -> PathBuf {
        self.root.join("uploads")
    }

    fn results_root(&self) -> PathBuf {
        self.root.join("results")
    }

    /// Directory that a job's uploaded script is stored in
    pub fn upload_dir(&self, job_id: i32) -> PathBuf {
        self.uploads_root().join(job_id.to_string())
    }

    /// Directory that a job's script runs in and writes its results to
    pub fn result_dir(&self, job_id: i32) -> PathBuf {
        self.results_root().join(job_id.to_string())
    }
}
