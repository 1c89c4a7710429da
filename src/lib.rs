//! # Picture Pipeline
//!
//! Background derivative generation for gallery uploads. Once an original is
//! stored, the pipeline produces four variants of it with an external
//! resizer (`vipsthumbnail` by default) and tells the caller when all of
//! them are done.
//!
//! # Architecture
//!
//! ```text
//! upload handler
//!     │  submit(picture, variants)
//!     ▼
//! fan-out ──► Thumbnail queue ─┐
//!         ──► Processed queue ─┼─► fair dispatcher ──► worker pool ──► Resizer
//!         ──► HiRes queue     ─┘                          │
//!                                                         ├─► CompletionTracker (fan-in)
//!                                                         └─► ControlChannel ──► tracing
//! ```
//!
//! Each submission becomes three tasks, one per [`task::TaskKind`]:
//!
//! | Kind | Outputs |
//! |------|---------|
//! | Thumbnail | 400px thumbnail |
//! | Processed | 1024px display image |
//! | HiRes | 800px `@2x` thumbnail, 2048px `@2x` display image |
//!
//! The three tasks share one [`tracker::CompletionTracker`]; the caller's
//! [`tracker::CompletionHandle`] fires once, after the last of them reports,
//! whether it succeeded or not.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`pipeline`] | Lifecycle, admission, per-kind queues, fair dispatch, worker pool |
//! | [`task`] | Task kinds, fan-out, per-task execution and outcomes |
//! | [`tracker`] | Fan-in: countdown, one-shot notification, per-variant outcome |
//! | [`control`] | Non-blocking log/error event channel and its sink |
//! | [`resizer`] | The `Resizer` seam and the `vipsthumbnail` backend |
//! | [`types`] | Picture descriptors, variant paths, date-partitioned storage layout |
//! | [`config`] | `pipeline.toml` loading, validation and merging |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## One Queue Per Kind
//!
//! The two hi-res calls take several times longer than a thumbnail. With a
//! single queue a burst of uploads would leave thumbnails waiting behind
//! hi-res work. Separate queues plus round-robin dispatch keep thumbnails
//! flowing no matter how deep the hi-res backlog is.
//!
//! ## Failures Complete, They Don't Hang
//!
//! A failed resize is reported on the control channel and recorded in the
//! picture's outcome, but it still counts towards completion. A task that
//! panics or is dropped reports `Abandoned`. Waiters always wake up.
//!
//! ## External Resizer
//!
//! libvips is fast and memory-frugal on large originals; invoking it as a
//! process keeps a crash in a decoder out of the server process.

pub mod config;
pub mod control;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod resizer;
pub mod task;
pub mod tracker;
pub mod types;

pub use pipeline::{LifecycleState, Pipeline, PipelineError, PipelineSettings, PipelineStats};
pub use tracker::{CompletionHandle, PictureOutcome};
pub use types::{PictureDescriptor, StorageLayout, VariantSpec};
