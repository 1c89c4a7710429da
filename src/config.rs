//! Pipeline configuration.
//!
//! Handles loading, validating and merging `pipeline.toml`. Stock defaults
//! are the base layer; a config file only needs the keys it changes.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [pipeline]
//! queue_capacity = 100      # Per-kind queue bound; submit blocks beyond this
//! # workers = 4             # Worker pool size (omit for auto = CPU cores)
//! event_buffer = 256        # Buffered log/error events before the oldest is dropped
//!
//! [resizer]
//! program = "vipsthumbnail" # External resizer, resolved through PATH
//! strip_metadata = true     # Drop EXIF/ICC/XMP from outputs
//!
//! [sizes]                   # Long-edge bounds in pixels (shrink only)
//! thumbnail = 400
//! processed = 1024
//! thumbnail_hidpi = 800
//! processed_hidpi = 2048
//!
//! [storage]
//! root = "images"           # Holds original/, thumbnail/, processed/
//! hidpi_marker = "@2x"      # Inserted after the key for double-density files
//!
//! [log]
//! level = "info"            # debug | info | warn | error
//! also_log_to_stdout = true
//! # file = "logs/pipeline.log"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::pipeline::PipelineSettings;
use crate::resizer::MaxDimension;
use crate::resizer::vips::DEFAULT_PROGRAM;
use crate::task::{TaskSettings, VariantSizes};
use crate::types::{HIDPI_MARKER, StorageLayout};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file name looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "pipeline.toml";

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Full configuration loaded from `pipeline.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pipeline: PipelineSection,
    pub resizer: ResizerSection,
    pub sizes: SizesSection,
    pub storage: StorageSection,
    pub log: LogSection,
}

/// Queue, worker and event buffer sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub queue_capacity: usize,
    /// Maximum number of concurrent resize tasks.
    /// When absent, defaults to the number of CPU cores. An explicit value
    /// is used as given, even above the core count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    pub event_buffer: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            workers: None,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResizerSection {
    pub program: String,
    pub strip_metadata: bool,
}

impl Default for ResizerSection {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            strip_metadata: true,
        }
    }
}

/// Long-edge bounds, in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SizesSection {
    pub thumbnail: u32,
    pub processed: u32,
    pub thumbnail_hidpi: u32,
    pub processed_hidpi: u32,
}

impl Default for SizesSection {
    fn default() -> Self {
        let sizes = VariantSizes::default();
        Self {
            thumbnail: sizes.thumbnail.value(),
            processed: sizes.processed.value(),
            thumbnail_hidpi: sizes.thumbnail_hidpi.value(),
            processed_hidpi: sizes.processed_hidpi.value(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub root: PathBuf,
    pub hidpi_marker: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("images"),
            hidpi_marker: HIDPI_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: String,
    pub also_log_to_stdout: bool,
    /// Append log lines to this file (parent directories are created).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            also_log_to_stdout: true,
            file: None,
        }
    }
}

impl Config {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "pipeline.queue_capacity must be at least 1".into(),
            ));
        }
        if self.pipeline.event_buffer == 0 {
            return Err(ConfigError::Validation(
                "pipeline.event_buffer must be at least 1".into(),
            ));
        }
        if self.pipeline.workers == Some(0) {
            return Err(ConfigError::Validation(
                "pipeline.workers must be at least 1".into(),
            ));
        }
        if self.resizer.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "resizer.program must not be empty".into(),
            ));
        }
        let s = &self.sizes;
        if [s.thumbnail, s.processed, s.thumbnail_hidpi, s.processed_hidpi].contains(&0) {
            return Err(ConfigError::Validation(
                "sizes values must be non-zero".into(),
            ));
        }
        if self.storage.hidpi_marker.is_empty() {
            return Err(ConfigError::Validation(
                "storage.hidpi_marker must not be empty".into(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "log.level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    pub fn variant_sizes(&self) -> VariantSizes {
        VariantSizes {
            thumbnail: MaxDimension(self.sizes.thumbnail),
            processed: MaxDimension(self.sizes.processed),
            thumbnail_hidpi: MaxDimension(self.sizes.thumbnail_hidpi),
            processed_hidpi: MaxDimension(self.sizes.processed_hidpi),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            queue_capacity: self.pipeline.queue_capacity,
            workers: effective_workers(&self.pipeline),
            event_buffer: self.pipeline.event_buffer,
            task: TaskSettings {
                sizes: self.variant_sizes(),
                strip_metadata: self.resizer.strip_metadata,
            },
        }
    }

    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout::new(&self.storage.root, &self.storage.hidpi_marker)
    }
}

/// Worker count: the configured value, else the CPU core count.
///
/// Each task spends its time waiting on a resizer process, so the core
/// count is a starting point and not a ceiling.
pub fn effective_workers(config: &PipelineSection) -> usize {
    config.workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    })
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(Config::default())
        .map_err(|e| ConfigError::Validation(format!("default config does not serialize: {e}")))
}

/// Sparse override: tables merge key by key, any other overlay value
/// replaces what the base had, base keys absent from the overlay survive.
pub fn merge_toml(mut base: toml::Value, overlay: toml::Value) -> toml::Value {
    apply_overlay(&mut base, overlay);
    base
}

fn apply_overlay(slot: &mut toml::Value, overlay: toml::Value) {
    match (slot, overlay) {
        (toml::Value::Table(section), toml::Value::Table(overrides)) => {
            for (key, value) in overrides {
                match section.get_mut(&key) {
                    Some(existing) => apply_overlay(existing, value),
                    None => {
                        section.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Read a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Stock values with the file's overrides on top, checked.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<Config, ConfigError> {
    let config: Config = overlay.into_iter().fold(base, merge_toml).try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`, falling back to stock defaults when the file is
/// missing. Unknown keys and out-of-range values are errors.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(path)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `pipeline.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Picture Pipeline Configuration
# =============================
#
# All keys are optional. Delete anything you don't need to change;
# missing keys fall back to the values shown here.

# ---------------------------------------------------------------------------
# Queues and workers
# ---------------------------------------------------------------------------
[pipeline]
# Tasks buffered per kind (thumbnail, processed, hi-res). Submitting a
# picture blocks while any of the three queues is full.
queue_capacity = 100

# Concurrent resize tasks. Omit to use one per CPU core. Each task mostly
# waits on vipsthumbnail, so values above the core count are allowed.
# workers = 4

# Log/error events buffered for the logger. When full, the oldest event is
# dropped so workers never wait on logging.
event_buffer = 256

# ---------------------------------------------------------------------------
# External resizer
# ---------------------------------------------------------------------------
[resizer]
# Invoked as: <program> <original> --size "<N>>" -o "<output>[strip]"
program = "vipsthumbnail"
strip_metadata = true

# ---------------------------------------------------------------------------
# Output sizes (long edge, pixels, shrink only)
# ---------------------------------------------------------------------------
[sizes]
thumbnail = 400
processed = 1024
thumbnail_hidpi = 800
processed_hidpi = 2048

# ---------------------------------------------------------------------------
# Storage layout: <root>/{original,thumbnail,processed}/YYYY/MM/DD/<key>.<ext>
# ---------------------------------------------------------------------------
[storage]
root = "images"
hidpi_marker = "@2x"

# ---------------------------------------------------------------------------
# Logging (RUST_LOG overrides level when set)
# ---------------------------------------------------------------------------
[log]
level = "info"
also_log_to_stdout = true
# file = "logs/pipeline.log"
"##
}
