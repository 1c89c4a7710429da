//! `tracing` subscriber setup from the `[log]` config section.
//!
//! `RUST_LOG` wins over `log.level` when set. Output goes to stdout, to an
//! appended log file, or both.

use crate::config::LogSection;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("cannot open log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("logger already installed: {0}")]
    Install(String),
}

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(config: &LogSection) -> Result<EnvFilter, LogError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(config.level.to_ascii_lowercase())?),
    }
}

fn open_log_file(path: &Path) -> Result<File, LogError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Writer for the configured destinations. With no destination at all,
/// output is discarded.
pub fn make_writer(config: &LogSection) -> Result<BoxMakeWriter, LogError> {
    let file = config.file.as_deref().map(open_log_file).transpose()?;
    let writer = match (file, config.also_log_to_stdout) {
        (Some(file), true) => BoxMakeWriter::new(std::io::stdout.and(Arc::new(file))),
        (Some(file), false) => BoxMakeWriter::new(Arc::new(file)),
        (None, true) => BoxMakeWriter::new(std::io::stdout),
        (None, false) => BoxMakeWriter::new(std::io::sink),
    };
    Ok(writer)
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(config: &LogSection) -> Result<(), LogError> {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(make_writer(config)?)
        .with_ansi(config.file.is_none())
        .with_thread_names(true)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter(config)?)
        .with(layer)
        .try_init()
        .map_err(|e| LogError::Install(e.to_string()))
}
