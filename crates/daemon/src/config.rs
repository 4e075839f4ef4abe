//! Mount configuration.
//!
//! One TOML file describes a mount: where the objects live, where local
//! state is kept, and optionally where to expose the filesystem.
//!
//! ```toml
//! state_dir = "/var/lib/objectfs/photos"
//! mount_point = "/mnt/photos"
//!
//! [storage]
//! type = "s3"
//! endpoint = "http://localhost:9000"
//! access_key = "minioadmin"
//! secret_key = "minioadmin"
//! bucket = "photos"
//!
//! [engine.flush]
//! conflict_policy = "merge_blocks"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use object_store::ObjectStoreConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Local directory for the journal and index snapshots
    pub state_dir: PathBuf,
    /// Where to expose the filesystem through FUSE; headless when unset
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    pub storage: ObjectStoreConfig,
    #[serde(default)]
    pub engine: common::Config,
    #[serde(default)]
    pub fuse: FuseOptions,
}

/// Kernel-facing mount options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseOptions {
    pub fs_name: String,
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// How long the kernel may cache attributes and entries
    pub attr_ttl_ms: u64,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self {
            fs_name: "objectfs".to_string(),
            allow_other: false,
            auto_unmount: true,
            attr_ttl_ms: 1_000,
        }
    }
}

impl FuseOptions {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }
}

impl MountConfig {
    pub fn new(storage: ObjectStoreConfig, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            state_dir: state_dir.into(),
            mount_point: None,
            engine: common::Config::default(),
            fuse: FuseOptions::default(),
        }
    }

    pub fn with_mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }

    pub fn with_engine(mut self, engine: common::Config) -> Self {
        self.engine = engine;
        self
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("state_dir is empty".into()));
        }
        if let Some(mount_point) = &self.mount_point {
            if mount_point.starts_with(&self.state_dir) {
                return Err(ConfigError::Invalid(format!(
                    "mount point {} is inside the state directory",
                    mount_point.display()
                )));
            }
        }
        self.engine
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.fuse.fs_name.is_empty() {
            return Err(ConfigError::Invalid("fuse.fs_name is empty".into()));
        }
        Ok(())
    }
}
