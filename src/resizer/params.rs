//! Parameter types for resize calls.
//!
//! These describe a single invocation and nothing else; the backend decides
//! how to turn them into a process command line.

use std::fmt;
use std::path::PathBuf;

/// Upper bound on the long edge of an output, in pixels.
///
/// Outputs are only ever shrunk: an original smaller than the bound is kept
/// at its own size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaxDimension(pub u32);

impl MaxDimension {
    pub fn value(self) -> u32 {
        self.0
    }

    /// `vipsthumbnail --size` argument; the trailing `>` means shrink-only.
    pub fn shrink_only_arg(self) -> String {
        format!("{}>", self.0)
    }
}

impl fmt::Display for MaxDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}px", self.0)
    }
}

/// One resize call: input, bound, output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeRequest {
    pub source: PathBuf,
    pub output: PathBuf,
    pub max_dimension: MaxDimension,
    /// Drop EXIF/ICC/XMP from the output.
    pub strip_metadata: bool,
}
