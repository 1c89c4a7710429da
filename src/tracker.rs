//! Fan-in for one submission.
//!
//! A [`CompletionTracker`] counts the tasks of one picture that have not yet
//! reported. The report that brings the count to zero fires a one-shot
//! notification: every thread blocked in [`CompletionHandle::wait`] wakes up,
//! every registered callback runs once, and every later
//! [`CompletionHandle::try_outcome`] sees the same [`PictureOutcome`].
//!
//! Reports arrive in any order from any worker thread. The count lives under
//! a mutex next to the collected outcomes, and waiters block on a condvar, so
//! there is no polling in the steady state. Giving up on a wait (timeout)
//! does not affect the tasks: they still report, and the outcome is still
//! recorded for anyone who asks later.

use crate::pipeline::PipelineError;
use crate::task::{TaskKind, VariantOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type Callback = Box<dyn FnOnce(&PictureOutcome) + Send>;

/// Per-variant result for one picture, available once every task reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PictureOutcome {
    pub key: String,
    pub variants: BTreeMap<TaskKind, VariantOutcome>,
}

impl PictureOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.variants.values().all(VariantOutcome::is_success)
    }

    /// Kinds that did not succeed, in kind order.
    pub fn failed_kinds(&self) -> Vec<TaskKind> {
        self.variants
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn get(&self, kind: TaskKind) -> Option<&VariantOutcome> {
        self.variants.get(&kind)
    }
}

struct TrackerState {
    remaining: usize,
    variants: BTreeMap<TaskKind, VariantOutcome>,
    outcome: Option<PictureOutcome>,
    callbacks: Vec<Callback>,
}

pub struct CompletionTracker {
    key: String,
    expected: usize,
    state: Mutex<TrackerState>,
    done: Condvar,
}

impl fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("key", &self.key)
            .field("expected", &self.expected)
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl CompletionTracker {
    pub fn new(key: impl Into<String>, expected: usize) -> Arc<Self> {
        let key = key.into();
        let outcome = (expected == 0).then(|| PictureOutcome {
            key: key.clone(),
            variants: BTreeMap::new(),
        });
        Arc::new(Self {
            key,
            expected,
            state: Mutex::new(TrackerState {
                remaining: expected,
                variants: BTreeMap::new(),
                outcome,
                callbacks: Vec::new(),
            }),
            done: Condvar::new(),
        })
    }

    // Callbacks run outside the lock, so a poisoned lock only means a waiter
    // panicked; the counters themselves are never left half-updated.
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn remaining(&self) -> usize {
        self.lock().remaining
    }

    /// Record one task's outcome and decrement.
    ///
    /// Returns `true` for the report that completed the set. Reports after
    /// completion are ignored, so the count never goes below zero.
    pub fn complete(&self, kind: TaskKind, outcome: VariantOutcome) -> bool {
        let (finished, callbacks) = {
            let mut state = self.lock();
            if state.remaining == 0 {
                return false;
            }
            state.variants.entry(kind).or_insert(outcome);
            state.remaining -= 1;
            if state.remaining > 0 {
                return false;
            }

            let finished = PictureOutcome {
                key: self.key.clone(),
                variants: std::mem::take(&mut state.variants),
            };
            state.outcome = Some(finished.clone());
            (finished, std::mem::take(&mut state.callbacks))
        };

        self.done.notify_all();
        for callback in callbacks {
            callback(&finished);
        }
        true
    }

    pub fn outcome(&self) -> Option<PictureOutcome> {
        self.lock().outcome.clone()
    }

    /// Block until every task reported.
    pub fn wait(&self) -> PictureOutcome {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until every task reported, or `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<PictureOutcome, PipelineError> {
        let (state, _) = self
            .done
            .wait_timeout_while(self.lock(), timeout, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.outcome.clone().ok_or_else(|| PipelineError::TrackerTimeout {
            key: self.key.clone(),
            waited: timeout,
        })
    }

    /// Run `callback` once with the outcome: immediately if already
    /// complete, otherwise on the thread of the last reporting task.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&PictureOutcome) + Send + 'static,
    {
        let ready = {
            let mut state = self.lock();
            match state.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&ready);
    }
}

/// Caller-side view of one submission. Cheap to clone; every clone observes
/// the same one-shot completion.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    tracker: Arc<CompletionTracker>,
}

impl CompletionHandle {
    pub(crate) fn new(tracker: Arc<CompletionTracker>) -> Self {
        Self { tracker }
    }

    pub fn key(&self) -> &str {
        self.tracker.key()
    }

    pub fn expected(&self) -> usize {
        self.tracker.expected()
    }

    pub fn remaining(&self) -> usize {
        self.tracker.remaining()
    }

    pub fn is_complete(&self) -> bool {
        self.tracker.outcome().is_some()
    }

    /// Non-blocking poll.
    pub fn try_outcome(&self) -> Option<PictureOutcome> {
        self.tracker.outcome()
    }

    pub fn wait(&self) -> PictureOutcome {
        self.tracker.wait()
    }

    /// Fails with [`PipelineError::TrackerTimeout`] if the picture is not
    /// done in time. The tasks keep running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<PictureOutcome, PipelineError> {
        self.tracker.wait_timeout(timeout)
    }

    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&PictureOutcome) + Send + 'static,
    {
        self.tracker.on_complete(callback);
    }
}
