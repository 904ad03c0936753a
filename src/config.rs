//! Run configuration.
//!
//! This module provides [`MigrationConfig`], which controls revision
//! selection, lossy handling, report and preview locations, checkpointing
//! and vocabulary lookups. It can be loaded from a TOML file; command line
//! flags are layered on top with the `with_*` methods.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collaborators::LookupPolicy;
use crate::error::{MigrationError, Result};
use crate::versions::Visibility;

/// Vocabulary lookup settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Retries after a transient failure
    pub retries: u32,
    /// Minimum score accepted as a flagged match
    pub curation_threshold: f64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        let policy = LookupPolicy::default();
        Self {
            retries: policy.retries,
            curation_threshold: policy.curation_threshold,
        }
    }
}

impl From<LookupConfig> for LookupPolicy {
    fn from(config: LookupConfig) -> Self {
        LookupPolicy {
            retries: config.retries,
            curation_threshold: config.curation_threshold,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Configuration of a migration run.
///
/// # Examples
///
/// ```ignore
/// use cds_migrator::config::MigrationConfig;
///
/// let config = MigrationConfig::new()
///     .with_dry_run(true)
///     .with_report_path("report.json");
/// assert!(config.latest_only);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct MigrationConfig {
    // === Revision selection ===
    /// Convert only the latest revision of each record.
    ///
    /// When false, every revision is converted in chronological order and
    /// the last one is kept.
    pub latest_only: bool,

    /// Keep documents whose source had untransformed tags.
    ///
    /// The missing tags are still reported in the ledger.
    pub tolerate_lossy: bool,

    // === Run control ===
    /// Transform and report without loading into the store.
    pub dry_run: bool,

    /// Skip records already present in the loaded report.
    pub resume: bool,

    /// Run the transform phase on a thread pool.
    pub parallel: bool,

    /// Persist the report every this many records.
    pub checkpoint_interval: usize,

    // === Output ===
    /// Report file; nothing is persisted when unset.
    pub report_path: Option<PathBuf>,

    /// Directory receiving one `<legacy_id>.json` preview per record.
    pub preview_dir: Option<PathBuf>,

    /// Metadata access applied when no file says otherwise.
    pub record_access: Visibility,

    /// Vocabulary lookup settings.
    pub lookup: LookupConfig,

    /// Log output settings.
    pub logging: LoggingConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            latest_only: true,
            tolerate_lossy: false,
            dry_run: false,
            resume: false,
            parallel: false,
            checkpoint_interval: 100,
            report_path: None,
            preview_dir: None,
            record_access: Visibility::Public,
            lookup: LookupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MigrationConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Configuration`] on syntax errors or invalid values.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| MigrationError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or
    /// [`MigrationError::Configuration`] if it is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Configuration`] for a zero checkpoint
    /// interval or a threshold outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_interval == 0 {
            return Err(MigrationError::Configuration(
                "checkpoint_interval must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lookup.curation_threshold) {
            return Err(MigrationError::Configuration(format!(
                "lookup.curation_threshold must be within [0, 1], got {}",
                self.lookup.curation_threshold
            )));
        }
        Ok(())
    }

    /// Sets whether only the latest revision is converted.
    #[must_use]
    pub const fn with_latest_only(mut self, enabled: bool) -> Self {
        self.latest_only = enabled;
        self
    }

    /// Sets whether lossy conversions are tolerated.
    #[must_use]
    pub const fn with_tolerate_lossy(mut self, enabled: bool) -> Self {
        self.tolerate_lossy = enabled;
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Enables resuming from the existing report.
    #[must_use]
    pub const fn with_resume(mut self, enabled: bool) -> Self {
        self.resume = enabled;
        self
    }

    /// Enables the parallel transform phase.
    #[must_use]
    pub const fn with_parallel(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }

    /// Sets the checkpoint interval.
    #[must_use]
    pub const fn with_checkpoint_interval(mut self, every: usize) -> Self {
        self.checkpoint_interval = every;
        self
    }

    /// Sets the report file.
    #[must_use]
    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// Sets the preview directory.
    #[must_use]
    pub fn with_preview_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.preview_dir = Some(dir.into());
        self
    }

    /// Sets the default record access.
    #[must_use]
    pub const fn with_record_access(mut self, access: Visibility) -> Self {
        self.record_access = access;
        self
    }
}
