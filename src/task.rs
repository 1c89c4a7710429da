//! Variant tasks: the unit of work the dispatcher hands to a worker.
//!
//! Every submission fans out into exactly three tasks, one per [`TaskKind`],
//! all sharing one [`CompletionTracker`]:
//!
//! | Kind | Calls | Bound | Output |
//! |---|---|---|---|
//! | `Thumbnail` | 1 | 400px | thumbnail x1 |
//! | `Processed` | 1 | 1024px | processed x1 |
//! | `HiRes` | 2 | 800px, 2048px | thumbnail x2, processed x2 |
//!
//! A task always reports to its tracker exactly once. Normal execution
//! reports through [`CompletionGuard::finish`]; a task that panics or is
//! dropped unexecuted reports [`VariantOutcome::Abandoned`] from the guard's
//! `Drop`, so nobody waiting on the picture is left hanging.

use crate::control::ControlChannel;
use crate::resizer::{MaxDimension, ResizeRequest, Resizer};
use crate::tracker::{CompletionHandle, CompletionTracker};
use crate::types::{PictureDescriptor, VariantSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// The three kinds of derivative work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Thumbnail,
    Processed,
    HiRes,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Thumbnail, TaskKind::Processed, TaskKind::HiRes];

    /// Stable position, used to index per-kind queues.
    pub fn index(self) -> usize {
        match self {
            TaskKind::Thumbnail => 0,
            TaskKind::Processed => 1,
            TaskKind::HiRes => 2,
        }
    }

    /// Short tag for log lines (`[tn]`, `[pc]`, `[hr]`).
    pub fn tag(self) -> &'static str {
        match self {
            TaskKind::Thumbnail => "tn",
            TaskKind::Processed => "pc",
            TaskKind::HiRes => "hr",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Thumbnail => "Thumbnail",
            TaskKind::Processed => "Processed",
            TaskKind::HiRes => "HiRes",
        };
        f.write_str(name)
    }
}

/// Long-edge bounds for the four outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSizes {
    pub thumbnail: MaxDimension,
    pub processed: MaxDimension,
    pub thumbnail_hidpi: MaxDimension,
    pub processed_hidpi: MaxDimension,
}

impl Default for VariantSizes {
    fn default() -> Self {
        Self {
            thumbnail: MaxDimension(400),
            processed: MaxDimension(1024),
            thumbnail_hidpi: MaxDimension(800),
            processed_hidpi: MaxDimension(2048),
        }
    }
}

/// Everything a worker needs besides the task itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    pub sizes: VariantSizes,
    pub strip_metadata: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            sizes: VariantSizes::default(),
            strip_metadata: true,
        }
    }
}

/// One output that could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResizeFailure {
    pub output: PathBuf,
    pub max_dimension: u32,
    /// Resizer diagnostic (process output or start-up error).
    pub detail: String,
}

/// Result of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariantOutcome {
    /// Every output of the task was written.
    Succeeded,
    /// At least one resize call failed; the others were still attempted.
    Failed { failures: Vec<ResizeFailure> },
    /// The task ended without reporting (panicked, or dropped before it ran).
    Abandoned,
}

impl VariantOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, VariantOutcome::Succeeded)
    }
}

/// Reports a task to its tracker exactly once, even on unwind.
pub(crate) struct CompletionGuard {
    tracker: Arc<CompletionTracker>,
    kind: TaskKind,
    reported: bool,
}

impl CompletionGuard {
    pub(crate) fn new(tracker: Arc<CompletionTracker>, kind: TaskKind) -> Self {
        Self {
            tracker,
            kind,
            reported: false,
        }
    }

    pub(crate) fn finish(mut self, outcome: VariantOutcome) {
        self.reported = true;
        self.tracker.complete(self.kind, outcome);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.reported {
            self.tracker.complete(self.kind, VariantOutcome::Abandoned);
        }
    }
}

/// A single unit of derivative work for one picture.
pub struct VariantTask {
    kind: TaskKind,
    picture: Arc<PictureDescriptor>,
    variants: Arc<VariantSpec>,
    completion: CompletionGuard,
}

impl fmt::Debug for VariantTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariantTask")
            .field("kind", &self.kind)
            .field("picture", &self.picture.key)
            .finish()
    }
}

/// Split one submission into its three tasks plus the handle that observes them.
pub(crate) fn fan_out(
    picture: PictureDescriptor,
    variants: VariantSpec,
) -> (CompletionHandle, [VariantTask; 3]) {
    let tracker = CompletionTracker::new(picture.key.clone(), TaskKind::ALL.len());
    let picture = Arc::new(picture);
    let variants = Arc::new(variants);

    let tasks = TaskKind::ALL.map(|kind| VariantTask {
        kind,
        picture: Arc::clone(&picture),
        variants: Arc::clone(&variants),
        completion: CompletionGuard::new(Arc::clone(&tracker), kind),
    });

    (CompletionHandle::new(tracker), tasks)
}

impl VariantTask {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn picture(&self) -> &PictureDescriptor {
        &self.picture
    }

    /// The resize calls this task makes, in order.
    pub fn requests(&self, settings: &TaskSettings) -> Vec<ResizeRequest> {
        let sizes = &settings.sizes;
        let targets = match self.kind {
            TaskKind::Thumbnail => vec![(sizes.thumbnail, &self.variants.thumbnail.x1)],
            TaskKind::Processed => vec![(sizes.processed, &self.variants.processed.x1)],
            TaskKind::HiRes => vec![
                (sizes.thumbnail_hidpi, &self.variants.thumbnail.x2),
                (sizes.processed_hidpi, &self.variants.processed.x2),
            ],
        };

        targets
            .into_iter()
            .map(|(max_dimension, output)| ResizeRequest {
                source: self.picture.original.clone(),
                output: output.clone(),
                max_dimension,
                strip_metadata: settings.strip_metadata,
            })
            .collect()
    }

    /// Run every resize call, report failures to the control channel, then
    /// report the outcome to the tracker.
    pub(crate) fn run(
        self,
        resizer: &dyn Resizer,
        settings: &TaskSettings,
        control: &ControlChannel,
    ) -> VariantOutcome {
        let requests = self.requests(settings);
        let kind = self.kind;
        let key = self.picture.key.as_str();

        control.log(
            kind,
            key,
            format!(
                "[{}] processing {}",
                kind.tag(),
                self.picture.original.display()
            ),
        );

        let mut failures = Vec::new();
        // Outputs are independent: a failed call never skips the next one
        for request in &requests {
            if let Err(err) = resizer.resize(request) {
                control.error(
                    kind,
                    key,
                    format!("[{}] {} → {}: {}", kind.tag(), kind, request.output.display(), err),
                );
                failures.push(ResizeFailure {
                    output: request.output.clone(),
                    max_dimension: request.max_dimension.value(),
                    detail: err.diagnostic(),
                });
            }
        }

        let outcome = if failures.is_empty() {
            control.log(
                kind,
                key,
                format!("[{}] finished {}", kind.tag(), self.picture.original.display()),
            );
            VariantOutcome::Succeeded
        } else {
            control.log(
                kind,
                key,
                format!(
                    "[{}] finished {} with {} of {} output(s) failed",
                    kind.tag(),
                    self.picture.original.display(),
                    failures.len(),
                    requests.len()
                ),
            );
            VariantOutcome::Failed { failures }
        };

        self.completion.finish(outcome.clone());
        outcome
    }
}
