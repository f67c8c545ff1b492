//! Configuration management for stackfs

use crate::branch::BranchPerm;
use crate::error::{Error, Result};
use crate::inode::FIRST_INO;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnionConfig {
    /// Branches, highest priority first
    pub branches: Vec<BranchConfig>,

    /// Inode number remapping
    pub xino: XinoConfig,

    /// Pseudo-link registry
    pub plink: PlinkConfig,

    /// How much to trust the backing trees not to change behind our back
    pub udba: Udba,
}

/// One branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Root directory of the branch on the host
    pub path: PathBuf,

    /// Permission
    pub perm: BranchPerm,
}

/// Inode number remap space
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XinoConfig {
    /// First number handed to a non-root inode
    pub first_ino: u64,

    /// Highest number that may be handed out
    pub max_ino: u64,
}

/// Pseudo-link registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlinkConfig {
    /// Keep cross-branch hardlink aliases alive
    pub enabled: bool,

    /// Log every entry released at teardown
    pub verbose_teardown: bool,
}

/// User's direct branch access policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Udba {
    /// Trust the cache; pins skip re-lookup
    None,
    /// Re-validate backing entries when pinning
    #[default]
    Reval,
}

impl Udba {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "none" => Some(Udba::None),
            "reval" => Some(Udba::Reval),
            _ => None,
        }
    }
}

impl Default for XinoConfig {
    fn default() -> Self {
        Self {
            first_ino: FIRST_INO,
            max_ino: u64::MAX,
        }
    }
}

impl Default for PlinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verbose_teardown: false,
        }
    }
}

impl BranchConfig {
    pub fn new(path: impl Into<PathBuf>, perm: BranchPerm) -> Self {
        Self {
            path: path.into(),
            perm,
        }
    }

    /// Parse a `dir=perm:dir=perm` list; a missing `=perm` means `rw` for
    /// the first branch and `ro` for the rest
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        let mut branches = Vec::new();
        for (i, item) in s.split(':').filter(|item| !item.trim().is_empty()).enumerate() {
            let (path, perm) = match item.rsplit_once('=') {
                Some((path, perm)) => {
                    let perm = BranchPerm::parse(perm).ok_or_else(|| {
                        Error::InvalidConfig(format!("Unknown branch permission: {}", perm))
                    })?;
                    (path, perm)
                }
                None if i == 0 => (item, BranchPerm::Rw),
                None => (item, BranchPerm::Ro),
            };
            branches.push(Self::new(path.trim(), perm));
        }
        Ok(branches)
    }
}

impl UnionConfig {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: UnionConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `STACKFS_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(branches) = var("STACKFS_BRANCHES") {
            let branches = BranchConfig::parse_list(&branches)?;
            if !branches.is_empty() {
                self.branches = branches;
            }
        }

        if let Some(udba) = var("STACKFS_UDBA") {
            self.udba = Udba::parse(&udba)
                .ok_or_else(|| Error::InvalidConfig(format!("Unknown udba mode: {}", udba)))?;
        }

        if let Some(plink) = var("STACKFS_PLINK") {
            match plink.trim() {
                "1" | "true" | "on" => self.plink.enabled = true,
                "0" | "false" | "off" => self.plink.enabled = false,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "STACKFS_PLINK must be on or off, got {}",
                        other
                    )))
                }
            }
        }

        if let Some(max_ino) = var("STACKFS_MAX_INO") {
            self.xino.max_ino = max_ino.trim().parse::<u64>().map_err(|_| {
                Error::InvalidConfig(format!(
                    "STACKFS_MAX_INO must be an inode number, got {}",
                    max_ino
                ))
            })?;
        }

        Ok(())
    }

    /// Create a new config from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = UnionConfig::default();
        config.apply_env_overrides()?;

        if config.branches.is_empty() {
            return Err(Error::InvalidConfig(
                "STACKFS_BRANCHES environment variable is required".to_string(),
            ));
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one branch is required".to_string(),
            ));
        }

        if self.xino.first_ino >= self.xino.max_ino {
            return Err(Error::InvalidConfig(format!(
                "xino.first_ino ({}) must be below xino.max_ino ({})",
                self.xino.first_ino, self.xino.max_ino
            )));
        }

        if !self.branches.iter().any(|b| b.perm.is_writable()) {
            warn!("no writable branch configured; the union is read-only");
        }

        Ok(())
    }
}
