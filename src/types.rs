//! Picture descriptors and variant target paths.
//!
//! A [`PictureDescriptor`] names one stored original; a [`VariantSpec`] names
//! the four files derived from it. Both are plain values: the upload handler
//! builds them (usually through [`StorageLayout`]) and hands them to
//! [`Pipeline::submit`](crate::pipeline::Pipeline::submit).
//!
//! ## Layout on disk
//!
//! ```text
//! images/
//! ├── original/2026/10/19/3f2c…e1.jpg
//! ├── thumbnail/2026/10/19/3f2c…e1.jpg       # 400px
//! ├── thumbnail/2026/10/19/3f2c…e1@2x.jpg    # 800px
//! ├── processed/2026/10/19/3f2c…e1.jpg       # 1024px
//! └── processed/2026/10/19/3f2c…e1@2x.jpg    # 2048px
//! ```
//!
//! The key is unique per upload, so no two pictures ever share an output
//! path, and re-submitting a descriptor overwrites the same four files.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default marker inserted after the key for double-density outputs.
pub const HIDPI_MARKER: &str = "@2x";

/// One uploaded original. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PictureDescriptor {
    /// Path-safe unique key (a simple-format UUID for layout-allocated pictures).
    pub key: String,
    /// File extension without the leading dot.
    pub ext: String,
    /// Where the original was stored.
    pub original: PathBuf,
}

impl PictureDescriptor {
    pub fn new(key: impl Into<String>, ext: &str, original: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            ext: ext.trim_start_matches('.').to_string(),
            original: original.into(),
        }
    }

    /// `key.ext`, the file name shared by the original and every variant.
    pub fn file_name(&self) -> String {
        if self.ext.is_empty() {
            self.key.clone()
        } else {
            format!("{}.{}", self.key, self.ext)
        }
    }
}

/// Standard and double-density target for one size class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizePaths {
    pub x1: PathBuf,
    pub x2: PathBuf,
}

/// The four output paths of one picture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub thumbnail: SizePaths,
    pub processed: SizePaths,
}

impl VariantSpec {
    /// Build a spec from the two standard-resolution paths, deriving the
    /// double-density ones by marking the key in each file name.
    pub fn from_base(
        key: &str,
        thumbnail: impl Into<PathBuf>,
        processed: impl Into<PathBuf>,
        marker: &str,
    ) -> Self {
        let thumbnail = thumbnail.into();
        let processed = processed.into();
        Self {
            thumbnail: SizePaths {
                x2: hidpi_path(&thumbnail, key, marker),
                x1: thumbnail,
            },
            processed: SizePaths {
                x2: hidpi_path(&processed, key, marker),
                x1: processed,
            },
        }
    }

    /// All four outputs: thumbnail x1, processed x1, thumbnail x2, processed x2.
    pub fn outputs(&self) -> [&Path; 4] {
        [
            &self.thumbnail.x1,
            &self.processed.x1,
            &self.thumbnail.x2,
            &self.processed.x2,
        ]
    }
}

/// Insert `marker` after the first occurrence of `key` in the file name.
///
/// When the key does not appear in the file name the marker goes right
/// before the extension, so the result never equals `base`.
pub fn hidpi_path(base: &Path, key: &str, marker: &str) -> PathBuf {
    let Some(name) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return base.to_path_buf();
    };

    let marked = if !key.is_empty() && name.contains(key) {
        name.replacen(key, &format!("{key}{marker}"), 1)
    } else {
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem}{marker}.{ext}"),
            _ => format!("{name}{marker}"),
        }
    };

    base.with_file_name(marked)
}

/// Date-partitioned image tree: `root/{original,thumbnail,processed}/YYYY/MM/DD`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    marker: String,
}

impl StorageLayout {
    pub const ORIGINAL: &'static str = "original";
    pub const THUMBNAIL: &'static str = "thumbnail";
    pub const PROCESSED: &'static str = "processed";

    pub fn new(root: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            marker: marker.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `YYYY/MM/DD` for the given day.
    pub fn partition(date: NaiveDate) -> PathBuf {
        PathBuf::from(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    fn dir(&self, subtree: &str, date: NaiveDate) -> PathBuf {
        self.root.join(subtree).join(Self::partition(date))
    }

    /// Create the three partition directories for `date`.
    ///
    /// The pipeline itself never creates directories; callers run this
    /// before submitting.
    pub fn prepare(&self, date: NaiveDate) -> io::Result<()> {
        for subtree in [Self::ORIGINAL, Self::THUMBNAIL, Self::PROCESSED] {
            std::fs::create_dir_all(self.dir(subtree, date))?;
        }
        Ok(())
    }

    /// Descriptor and variant paths for a known key.
    pub fn place(&self, key: &str, ext: &str, date: NaiveDate) -> (PictureDescriptor, VariantSpec) {
        let mut picture = PictureDescriptor::new(key, ext, PathBuf::new());
        let name = picture.file_name();
        picture.original = self.dir(Self::ORIGINAL, date).join(&name);

        let variants = VariantSpec::from_base(
            key,
            self.dir(Self::THUMBNAIL, date).join(&name),
            self.dir(Self::PROCESSED, date).join(&name),
            &self.marker,
        );
        (picture, variants)
    }

    /// Allocate a fresh random key and place it.
    pub fn allocate(&self, ext: &str, date: NaiveDate) -> (PictureDescriptor, VariantSpec) {
        let key = Uuid::new_v4().simple().to_string();
        self.place(&key, ext, date)
    }
}
