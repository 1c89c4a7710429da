//! External resizer invocation.
//!
//! The pipeline never touches pixels itself. Every derivative is produced by
//! one call to a [`Resizer`]: "make `output` from `source`, no larger than N
//! pixels on the long edge, optionally without metadata".
//!
//! The module is split into:
//! - **Parameters**: [`ResizeRequest`] and [`MaxDimension`], describing *what* to produce
//! - **Backend**: the [`Resizer`] trait and [`ResizeError`]
//! - **Vips**: [`VipsThumbnail`], the production backend shelling out to `vipsthumbnail`

pub mod backend;
mod params;
pub mod vips;

pub use backend::{ResizeError, Resizer};
pub use params::{MaxDimension, ResizeRequest};
pub use vips::VipsThumbnail;
