//! `vipsthumbnail` subprocess backend.
//!
//! One call is one process:
//!
//! ```text
//! vipsthumbnail <source> --size "1024>" -o "<output>[strip]"
//! ```
//!
//! `>` makes the bound shrink-only, `[strip]` drops metadata from the saved
//! file. Success is a zero exit status; on failure the combined stdout and
//! stderr become the error payload.

use super::backend::{ResizeError, Resizer};
use super::params::ResizeRequest;
use std::ffi::OsString;
use std::process::Command;

/// Default program name, resolved through `PATH`.
pub const DEFAULT_PROGRAM: &str = "vipsthumbnail";

#[derive(Debug, Clone)]
pub struct VipsThumbnail {
    program: String,
}

impl VipsThumbnail {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument list for a request, without the program name.
    pub fn args(request: &ResizeRequest) -> Vec<OsString> {
        let mut output = request.output.as_os_str().to_os_string();
        if request.strip_metadata {
            output.push("[strip]");
        }

        vec![
            request.source.as_os_str().to_os_string(),
            "--size".into(),
            request.max_dimension.shrink_only_arg().into(),
            "-o".into(),
            output,
        ]
    }
}

impl Default for VipsThumbnail {
    fn default() -> Self {
        Self::new()
    }
}

impl Resizer for VipsThumbnail {
    fn resize(&self, request: &ResizeRequest) -> Result<(), ResizeError> {
        let result = Command::new(&self.program)
            .args(Self::args(request))
            .output()
            .map_err(|source| ResizeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if result.status.success() {
            return Ok(());
        }

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        Err(ResizeError::Failed {
            program: self.program.clone(),
            status: result.status.to_string(),
            output: output.trim_end().to_string(),
        })
    }
}
