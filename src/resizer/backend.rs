//! Resizer trait and error type.
//!
//! The [`Resizer`] trait is the seam between the pipeline and the outside
//! world. The production implementation is
//! [`VipsThumbnail`](super::vips::VipsThumbnail); tests swap in a recording
//! mock so the pipeline logic runs without libvips installed.

use super::params::ResizeRequest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResizeError {
    /// The process could not be started at all (missing binary, permissions).
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The process ran and exited unsuccessfully.
    #[error("{program} exited with {status}: {output}")]
    Failed {
        program: String,
        status: String,
        /// Combined stdout + stderr.
        output: String,
    },
}

impl ResizeError {
    /// Raw diagnostic text: the process output, or the start-up error.
    pub fn diagnostic(&self) -> String {
        match self {
            ResizeError::Spawn { source, .. } => source.to_string(),
            ResizeError::Failed { output, .. } => output.clone(),
        }
    }
}

/// Runs one resize synchronously.
///
/// Implementations block the calling thread for the whole call; the pipeline
/// only ever calls them from worker threads.
pub trait Resizer: Send + Sync {
    fn resize(&self, request: &ResizeRequest) -> Result<(), ResizeError>;
}
