//! The pipeline: per-kind queues, a fair dispatcher, a fixed worker pool and
//! the control channel, behind a start/submit/stop lifecycle.
//!
//! ```text
//! submit ──► [Thumbnail queue] ─┐
//!        ──► [Processed queue] ─┼─► dispatcher ──► rayon pool (N workers)
//!        ──► [HiRes queue]     ─┘    round-robin        │
//!                                                       ├─► CompletionTracker
//!                                                       └─► ControlChannel ──► EventSink
//! ```
//!
//! ## Admission
//!
//! Every submission enqueues all three of its tasks or none of them. An
//! admission gate serialises enqueueing against `stop`, so once `stop` has
//! flipped the state nothing new reaches a queue. The gate is only ever held
//! for a state check and three non-blocking pushes. [`Pipeline::submit`]
//! waits for room in all three queues on a condvar, which releases the gate
//! while parked, and is woken by every dispatch and by `stop`.
//! [`Pipeline::try_submit`] fails with [`PipelineError::QueueFull`] instead
//! of waiting.
//!
//! ## Dispatch
//!
//! The dispatcher holds one permit per worker and only pulls a task once a
//! permit is free, so tasks wait in their own queue rather than in the pool.
//! Pulls sweep the three queues round-robin from a rotating cursor: a
//! backlog in one kind never keeps a ready task of another kind waiting for
//! more than two pulls.
//!
//! ## Shutdown
//!
//! `stop` rejects new submissions, lets the dispatcher drain every queued
//! task, waits for running tasks, then flushes the control channel. Every
//! tracker of an accepted submission therefore completes. Concurrent `stop`
//! calls all return only once the pipeline is `Stopped`.

use crate::control::{ControlChannel, EventSink, TracingSink, run_sink};
use crate::resizer::Resizer;
use crate::task::{TaskKind, TaskSettings, VariantTask, fan_out};
use crate::tracker::CompletionHandle;
use crate::types::{PictureDescriptor, VariantSpec};
use crossbeam::channel::{self, Receiver, Select, Sender};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const LANES: usize = TaskKind::ALL.len();

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is stopping or stopped")]
    PipelineClosed,
    #[error("pipeline has not been started")]
    NotStarted,
    #[error("pipeline is already running")]
    AlreadyStarted,
    #[error("a task queue is full")]
    QueueFull,
    #[error("picture {key} not finished after {waited:?}")]
    TrackerTimeout { key: String, waited: Duration },
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Sizing and per-task settings for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Bound of each of the three per-kind queues.
    pub queue_capacity: usize,
    /// Concurrent resize tasks.
    pub workers: usize,
    /// Control events buffered before the oldest is dropped.
    pub event_buffer: usize,
    pub task: TaskSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            event_buffer: 256,
            task: TaskSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::NotStarted,
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::NotStarted => 0,
            LifecycleState::Running => 1,
            LifecycleState::Stopping => 2,
            LifecycleState::Stopped => 3,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::NotStarted => "not started",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub tasks_started: u64,
    pub tasks_finished: u64,
    /// Tasks waiting in the three queues.
    pub queued: usize,
    pub events_dropped: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Queues
// ============================================================================

/// One bounded FIFO per task kind, indexed by [`TaskKind::index`].
struct TaskQueues {
    lanes: [(Sender<VariantTask>, Receiver<VariantTask>); LANES],
}

impl TaskQueues {
    fn new(capacity: usize) -> Self {
        Self {
            lanes: TaskKind::ALL.map(|_| channel::bounded(capacity.max(1))),
        }
    }

    fn lane(&self, kind: TaskKind) -> &Sender<VariantTask> {
        &self.lanes[kind.index()].0
    }

    fn try_push(&self, task: VariantTask) -> Result<(), PipelineError> {
        self.lane(task.kind())
            .try_send(task)
            .map_err(|_| PipelineError::QueueFull)
    }

    fn has_room_for_all(&self) -> bool {
        self.lanes.iter().all(|(tx, _)| !tx.is_full())
    }

    fn queued(&self) -> usize {
        self.lanes.iter().map(|(_, rx)| rx.len()).sum()
    }

    /// Drop everything still queued; each dropped task reports `Abandoned`.
    fn abandon_all(&self) -> usize {
        self.lanes.iter().map(|(_, rx)| rx.try_iter().count()).sum()
    }

    /// Next task in round-robin order.
    ///
    /// Blocks while every queue is empty. Once `shutdown` fires, keeps
    /// handing out what is queued and returns `None` when all three queues
    /// are empty.
    fn pull(
        &self,
        cursor: &mut usize,
        shutdown: &Receiver<()>,
        draining: &mut bool,
    ) -> Option<VariantTask> {
        loop {
            for offset in 0..LANES {
                let idx = (*cursor + offset) % LANES;
                if let Ok(task) = self.lanes[idx].1.try_recv() {
                    *cursor = (idx + 1) % LANES;
                    return Some(task);
                }
            }
            if *draining {
                return None;
            }

            let mut select = Select::new();
            for (_, rx) in &self.lanes {
                select.recv(rx);
            }
            let stop = select.recv(shutdown);
            if select.ready() == stop {
                *draining = true;
            }
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// Broadcast-once signal: the sender is dropped, never sent on, so every
/// receiver clone observes the disconnect.
struct StopSignal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl StopSignal {
    fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }

    fn fire(&self) {
        lock(&self.tx).take();
    }
}

/// Serialises enqueueing against lifecycle changes.
///
/// Only the gate holder pushes, and it never blocks while holding the gate:
/// a submitter waiting for room parks on `room`, which releases it.
struct Admission {
    gate: Mutex<()>,
    room: Condvar,
}

impl Admission {
    fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            room: Condvar::new(),
        }
    }

    fn enter(&self) -> MutexGuard<'_, ()> {
        lock(&self.gate)
    }

    fn wait_for_room<'a>(&self, gate: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        self.room
            .wait(gate)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake parked submitters. Passing through the gate first means a
    /// submitter between its room check and its wait cannot miss the wakeup.
    fn wake(&self) {
        drop(lock(&self.gate));
        self.room.notify_all();
    }
}

/// Counts a task as finished when dropped, so panicking tasks are counted too.
struct FinishedCount<'a>(&'a AtomicU64);

impl Drop for FinishedCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// What worker and dispatcher threads need. Holds no thread handles, so the
/// threads never keep the pipeline itself alive.
struct Engine {
    settings: PipelineSettings,
    queues: TaskQueues,
    admission: Admission,
    resizer: Arc<dyn Resizer>,
    control: ControlChannel,
    started: AtomicU64,
    finished: AtomicU64,
}

impl Engine {
    fn execute(&self, task: VariantTask) {
        self.started.fetch_add(1, Ordering::Relaxed);
        let _finished = FinishedCount(&self.finished);
        tracing::debug!(kind = %task.kind(), picture = %task.picture().key, "task started");
        task.run(self.resizer.as_ref(), &self.settings.task, &self.control);
    }
}

/// Returns its permit to the dispatcher when the task ends, panics included.
struct Permit(Sender<()>);

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

fn dispatch(engine: Arc<Engine>, pool: rayon::ThreadPool, shutdown: Receiver<()>) {
    let workers = engine.settings.workers.max(1);
    let (permit_tx, permit_rx) = channel::bounded(workers);
    for _ in 0..workers {
        let _ = permit_tx.send(());
    }

    let mut cursor = 0;
    let mut draining = false;
    loop {
        if permit_rx.recv().is_err() {
            break;
        }
        let Some(task) = engine.queues.pull(&mut cursor, &shutdown, &mut draining) else {
            let _ = permit_tx.send(());
            break;
        };
        engine.admission.wake();
        let permit = Permit(permit_tx.clone());
        let engine = Arc::clone(&engine);
        pool.spawn(move || {
            let _permit = permit;
            engine.execute(task);
        });
    }

    // All permits back means no task is running
    for _ in 0..workers {
        let _ = permit_rx.recv();
    }
    tracing::debug!("dispatcher drained");
}

struct Threads {
    dispatcher: JoinHandle<()>,
    sink: JoinHandle<()>,
}

struct Shared {
    engine: Arc<Engine>,
    sink: Arc<dyn EventSink>,
    state: AtomicU8,
    shutdown: StopSignal,
    sink_shutdown: StopSignal,
    /// Fires once the state reaches `Stopped`.
    stopped: StopSignal,
    threads: Mutex<Option<Threads>>,
    submitted: AtomicU64,
}

impl Shared {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn ensure_accepting(&self) -> Result<(), PipelineError> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::NotStarted => Err(PipelineError::NotStarted),
            LifecycleState::Stopping | LifecycleState::Stopped => Err(PipelineError::PipelineClosed),
        }
    }

    fn spawn_threads(&self) -> Result<Threads, PipelineError> {
        let events = self.engine.control.receiver();
        let sink_stop = self.sink_shutdown.receiver();
        let event_sink = Arc::clone(&self.sink);
        let sink = thread::Builder::new()
            .name("pipeline-events".into())
            .spawn(move || run_sink(events, sink_stop, event_sink.as_ref()))
            .map_err(PipelineError::Spawn)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.engine.settings.workers.max(1))
            .thread_name(|i| format!("variant-worker-{i}"))
            .panic_handler(|_| tracing::error!("variant task panicked; reported as abandoned"))
            .build()?;

        let engine = Arc::clone(&self.engine);
        let shutdown = self.shutdown.receiver();
        let dispatcher = thread::Builder::new()
            .name("pipeline-dispatcher".into())
            .spawn(move || dispatch(engine, pool, shutdown))
            .map_err(PipelineError::Spawn)?;

        Ok(Threads { dispatcher, sink })
    }

    fn start(&self) -> Result<(), PipelineError> {
        let mut threads = lock(&self.threads);
        {
            let _gate = self.engine.admission.enter();
            match self.state() {
                LifecycleState::NotStarted => self.set_state(LifecycleState::Running),
                LifecycleState::Running => return Err(PipelineError::AlreadyStarted),
                LifecycleState::Stopping | LifecycleState::Stopped => {
                    return Err(PipelineError::PipelineClosed);
                }
            }
        }

        match self.spawn_threads() {
            Ok(spawned) => {
                *threads = Some(spawned);
                let settings = &self.engine.settings;
                tracing::info!(
                    workers = settings.workers,
                    queue_capacity = settings.queue_capacity,
                    "pipeline started"
                );
                Ok(())
            }
            Err(err) => {
                {
                    let _gate = self.engine.admission.enter();
                    self.set_state(LifecycleState::Stopped);
                }
                self.engine.admission.wake();
                self.shutdown.fire();
                self.sink_shutdown.fire();
                self.stopped.fire();
                let abandoned = self.engine.queues.abandon_all();
                tracing::error!(error = %err, abandoned, "pipeline failed to start");
                Err(err)
            }
        }
    }

    fn stop(&self) {
        let already_stopping = {
            let _gate = self.engine.admission.enter();
            match self.state() {
                LifecycleState::NotStarted => {
                    self.set_state(LifecycleState::Stopped);
                    self.shutdown.fire();
                    self.sink_shutdown.fire();
                    self.stopped.fire();
                    return;
                }
                LifecycleState::Running => {
                    self.set_state(LifecycleState::Stopping);
                    false
                }
                LifecycleState::Stopping => true,
                LifecycleState::Stopped => return,
            }
        };
        if already_stopping {
            // Disconnects when the stop in progress reaches `Stopped`
            let _ = self.stopped.receiver().recv();
            return;
        }

        // Parked submitters re-check the state and give up
        self.engine.admission.wake();
        tracing::info!(queued = self.engine.queues.queued(), "pipeline stopping");
        self.shutdown.fire();

        let threads = lock(&self.threads).take();
        if let Some(threads) = threads {
            if threads.dispatcher.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
            self.sink_shutdown.fire();
            if threads.sink.join().is_err() {
                tracing::error!("event sink thread panicked");
            }
        } else {
            self.sink_shutdown.fire();
        }

        // Only reachable with tasks left if the dispatcher died
        let abandoned = self.engine.queues.abandon_all();
        if abandoned > 0 {
            tracing::warn!(abandoned, "tasks abandoned at shutdown");
        }

        self.set_state(LifecycleState::Stopped);
        self.stopped.fire();
        tracing::info!(
            submitted = self.submitted.load(Ordering::Relaxed),
            events_dropped = self.engine.control.dropped(),
            "pipeline stopped"
        );
    }

    /// Fan out and push. Caller holds the gate and has seen room in every
    /// queue; only the gate holder pushes, so room can only have grown.
    fn enqueue(
        &self,
        picture: PictureDescriptor,
        variants: VariantSpec,
    ) -> Result<CompletionHandle, PipelineError> {
        let (handle, tasks) = fan_out(picture, variants);
        for task in tasks {
            self.engine.queues.try_push(task)?;
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn submit(
        &self,
        picture: PictureDescriptor,
        variants: VariantSpec,
    ) -> Result<CompletionHandle, PipelineError> {
        self.ensure_accepting()?;

        let admission = &self.engine.admission;
        let mut gate = admission.enter();
        loop {
            self.ensure_accepting()?;
            if self.engine.queues.has_room_for_all() {
                break;
            }
            gate = admission.wait_for_room(gate);
        }
        let handle = self.enqueue(picture, variants);
        drop(gate);
        handle
    }

    fn try_submit(
        &self,
        picture: PictureDescriptor,
        variants: VariantSpec,
    ) -> Result<CompletionHandle, PipelineError> {
        self.ensure_accepting()?;

        let _gate = self.engine.admission.enter();
        self.ensure_accepting()?;
        if !self.engine.queues.has_room_for_all() {
            return Err(PipelineError::QueueFull);
        }
        self.enqueue(picture, variants)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a pipeline. Clones share the same queues and workers; the
/// pipeline stops when the last clone is dropped.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("settings", &self.shared.engine.settings)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline whose control events go to `tracing`.
    pub fn new(settings: PipelineSettings, resizer: Arc<dyn Resizer>) -> Self {
        Self::with_sink(settings, resizer, Arc::new(TracingSink))
    }

    pub fn with_sink(
        settings: PipelineSettings,
        resizer: Arc<dyn Resizer>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let engine = Engine {
            queues: TaskQueues::new(settings.queue_capacity),
            admission: Admission::new(),
            control: ControlChannel::new(settings.event_buffer),
            settings,
            resizer,
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(Shared {
                engine: Arc::new(engine),
                sink,
                state: AtomicU8::new(LifecycleState::NotStarted.as_u8()),
                shutdown: StopSignal::new(),
                sink_shutdown: StopSignal::new(),
                stopped: StopSignal::new(),
                threads: Mutex::new(None),
                submitted: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.shared.engine.settings
    }

    /// Spawn the dispatcher, the worker pool and the event sink.
    ///
    /// Fails with [`PipelineError::AlreadyStarted`] when running, and with
    /// [`PipelineError::PipelineClosed`] once stopped; a stopped pipeline
    /// cannot be restarted.
    pub fn start(&self) -> Result<(), PipelineError> {
        self.shared.start()
    }

    /// Reject new submissions, finish every accepted task, flush events.
    ///
    /// Blocks until the pipeline is `Stopped`, including when another
    /// thread's stop is already in progress. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Enqueue the three tasks of one picture, waiting while any queue is
    /// full. A stop while waiting fails the call with
    /// [`PipelineError::PipelineClosed`].
    pub fn submit(
        &self,
        picture: PictureDescriptor,
        variants: VariantSpec,
    ) -> Result<CompletionHandle, PipelineError> {
        self.shared.submit(picture, variants)
    }

    /// Like [`submit`](Self::submit) but fails with
    /// [`PipelineError::QueueFull`] instead of blocking. Nothing is enqueued
    /// on failure.
    pub fn try_submit(
        &self,
        picture: PictureDescriptor,
        variants: VariantSpec,
    ) -> Result<CompletionHandle, PipelineError> {
        self.shared.try_submit(picture, variants)
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn stats(&self) -> PipelineStats {
        let engine = &self.shared.engine;
        PipelineStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            tasks_started: engine.started.load(Ordering::Relaxed),
            tasks_finished: engine.finished.load(Ordering::Relaxed),
            queued: engine.queues.queued(),
            events_dropped: engine.control.dropped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::tests::RecordingSink;
    use crate::resizer::backend::tests::MockResizer;
    use crate::resizer::{ResizeError, ResizeRequest};
    use crate::task::VariantOutcome;
    use crate::types::HIDPI_MARKER;
    use std::time::Instant;

    fn picture(key: &str) -> (PictureDescriptor, VariantSpec) {
        (
            PictureDescriptor::new(key, "jpg", format!("/orig/{key}.jpg")),
            VariantSpec::from_base(
                key,
                format!("/tn/{key}.jpg"),
                format!("/pc/{key}.jpg"),
                HIDPI_MARKER,
            ),
        )
    }

    fn settings(workers: usize, queue_capacity: usize) -> PipelineSettings {
        PipelineSettings {
            workers,
            queue_capacity,
            ..PipelineSettings::default()
        }
    }

    // =========================================================================
    // Queue selection
    // =========================================================================

    #[test]
    fn pull_serves_other_kinds_despite_hires_backlog() {
        let queues = TaskQueues::new(16);
        let (_stop_tx, stop_rx) = channel::bounded::<()>(0);
        let mut cursor = 0;
        let mut draining = false;
        let mut keep_alive = Vec::new();

        for i in 0..5 {
            let (p, v) = picture(&format!("backlog{i}"));
            let (_h, tasks) = fan_out(p, v);
            for task in tasks {
                if task.kind() == TaskKind::HiRes {
                    queues.try_push(task).unwrap();
                } else {
                    keep_alive.push(task);
                }
            }
        }
        let first = queues.pull(&mut cursor, &stop_rx, &mut draining).unwrap();
        assert_eq!(first.kind(), TaskKind::HiRes);

        let (p, v) = picture("fresh");
        let (_h, tasks) = fan_out(p, v);
        for task in tasks {
            queues.try_push(task).unwrap();
        }

        let next: Vec<TaskKind> = (0..3)
            .map(|_| queues.pull(&mut cursor, &stop_rx, &mut draining).unwrap().kind())
            .collect();
        assert!(next.contains(&TaskKind::Thumbnail));
        assert!(next.contains(&TaskKind::Processed));
    }

    #[test]
    fn pull_rotates_across_kinds() {
        let queues = TaskQueues::new(16);
        let (_stop_tx, stop_rx) = channel::bounded::<()>(0);
        let mut cursor = 0;
        let mut draining = false;

        let mut handles = Vec::new();
        for i in 0..3 {
            let (p, v) = picture(&format!("p{i}"));
            let (h, tasks) = fan_out(p, v);
            handles.push(h);
            for task in tasks {
                queues.try_push(task).unwrap();
            }
        }

        let order: Vec<TaskKind> = (0..6)
            .map(|_| queues.pull(&mut cursor, &stop_rx, &mut draining).unwrap().kind())
            .collect();
        assert_eq!(
            order,
            vec![
                TaskKind::Thumbnail,
                TaskKind::Processed,
                TaskKind::HiRes,
                TaskKind::Thumbnail,
                TaskKind::Processed,
                TaskKind::HiRes,
            ]
        );
    }

    #[test]
    fn pull_drains_then_ends_after_shutdown() {
        let queues = TaskQueues::new(4);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let mut cursor = 0;
        let mut draining = false;

        let (p, v) = picture("abc123");
        let (handle, tasks) = fan_out(p, v);
        for task in tasks {
            queues.try_push(task).unwrap();
        }
        drop(stop_tx);

        let mut pulled = 0;
        while let Some(task) = queues.pull(&mut cursor, &stop_rx, &mut draining) {
            drop(task);
            pulled += 1;
        }
        assert_eq!(pulled, 3);
        assert!(draining);
        assert!(handle.is_complete());
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[test]
    fn submit_before_start_is_rejected() {
        let resizer = Arc::new(MockResizer::new());
        let pipeline = Pipeline::new(settings(1, 4), resizer.clone());
        let (p, v) = picture("abc123");

        let err = pipeline.submit(p, v).unwrap_err();
        assert!(matches!(err, PipelineError::NotStarted));
        assert_eq!(pipeline.stats().submitted, 0);
    }

    #[test]
    fn start_twice_fails() {
        let pipeline = Pipeline::new(settings(1, 4), Arc::new(MockResizer::new()));
        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.start(),
            Err(PipelineError::AlreadyStarted)
        ));
        pipeline.stop();
        assert!(matches!(
            pipeline.start(),
            Err(PipelineError::PipelineClosed)
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let pipeline = Pipeline::new(settings(2, 4), Arc::new(MockResizer::new()));
        pipeline.start().unwrap();
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state(), LifecycleState::Stopped);
    }

    #[test]
    fn stop_without_start() {
        let pipeline = Pipeline::new(settings(1, 4), Arc::new(MockResizer::new()));
        pipeline.stop();
        assert_eq!(pipeline.state(), LifecycleState::Stopped);
        let (p, v) = picture("abc123");
        assert!(matches!(
            pipeline.submit(p, v),
            Err(PipelineError::PipelineClosed)
        ));
    }

    #[test]
    fn submitted_picture_completes() {
        let resizer = Arc::new(MockResizer::new());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::with_sink(settings(2, 4), resizer.clone(), sink.clone());
        pipeline.start().unwrap();

        let (p, v) = picture("abc123");
        let outcome = pipeline
            .submit(p, v)
            .unwrap()
            .wait_timeout(Duration::from_secs(10))
            .unwrap();
        pipeline.stop();

        assert!(outcome.all_succeeded());
        assert_eq!(resizer.get_calls().len(), 4);
        let stats = pipeline.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.tasks_started, 3);
        assert_eq!(stats.tasks_finished, 3);
        assert_eq!(stats.queued, 0);
        assert!(sink.errors().is_empty());
        assert!(!sink.events().is_empty());
    }

    #[test]
    fn stop_drains_queued_work() {
        let resizer = Arc::new(MockResizer::with_delay(Duration::from_millis(5)));
        let pipeline = Pipeline::new(settings(1, 64), resizer.clone());
        pipeline.start().unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let (p, v) = picture(&format!("pic{i}"));
                pipeline.submit(p, v).unwrap()
            })
            .collect();
        pipeline.stop();

        for handle in handles {
            let outcome = handle.try_outcome().expect("drained before stop returned");
            assert!(outcome.all_succeeded());
        }
        assert_eq!(resizer.get_calls().len(), 40);
    }

    #[test]
    fn try_submit_fails_fast_without_partial_enqueue() {
        let resizer = Arc::new(MockResizer::with_delay(Duration::from_millis(200)));
        let pipeline = Pipeline::new(settings(1, 1), resizer.clone());
        pipeline.start().unwrap();

        let (p, v) = picture("first");
        let first = pipeline.submit(p, v).unwrap();

        // One worker busy for 200ms; at least the processed and hi-res
        // queues still hold the first picture's tasks.
        let (p, v) = picture("second");
        let err = pipeline.try_submit(p, v).unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull));
        assert_eq!(pipeline.stats().submitted, 1);

        pipeline.stop();
        assert!(first.try_outcome().unwrap().all_succeeded());
        assert!(resizer.get_calls().iter().all(|c| !c.output.contains("second")));
    }

    #[test]
    fn failing_variant_is_reported_per_kind() {
        let resizer = Arc::new(MockResizer::failing_for(&["/pc/abc123.jpg"]));
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::with_sink(settings(3, 4), resizer, sink.clone());
        pipeline.start().unwrap();

        let (p, v) = picture("abc123");
        let outcome = pipeline.submit(p, v).unwrap().wait();
        pipeline.stop();

        assert_eq!(outcome.failed_kinds(), vec![TaskKind::Processed]);
        assert!(matches!(
            outcome.get(TaskKind::Processed),
            Some(VariantOutcome::Failed { .. })
        ));
        assert_eq!(sink.errors().len(), 1);
    }

    #[test]
    fn dropping_last_handle_stops_pipeline() {
        let resizer = Arc::new(MockResizer::new());
        let pipeline = Pipeline::new(settings(1, 4), resizer.clone());
        pipeline.start().unwrap();
        let (p, v) = picture("abc123");
        let handle = pipeline.submit(p, v).unwrap();

        drop(pipeline);
        assert!(handle.try_outcome().unwrap().all_succeeded());
    }

    // =========================================================================
    // Admission and shutdown under contention
    // =========================================================================

    /// Submits in the background until one `submit` is parked on a full queue.
    fn with_parked_submitter(
        pipeline: &Pipeline,
        count: usize,
    ) -> JoinHandle<Vec<Result<CompletionHandle, PipelineError>>> {
        let background = {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                (0..count)
                    .map(|i| {
                        let (p, v) = picture(&format!("bg{i}"));
                        pipeline.submit(p, v)
                    })
                    .collect::<Vec<_>>()
            })
        };
        while pipeline.stats().submitted < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(30));
        background
    }

    #[test]
    fn try_submit_does_not_wait_behind_a_parked_submit() {
        let resizer = Arc::new(MockResizer::with_delay(Duration::from_millis(200)));
        let pipeline = Pipeline::new(settings(1, 1), resizer.clone());
        pipeline.start().unwrap();
        let background = with_parked_submitter(&pipeline, 3);

        let (p, v) = picture("fast");
        let began = Instant::now();
        let result = pipeline.try_submit(p, v);
        let elapsed = began.elapsed();

        assert!(matches!(result, Err(PipelineError::QueueFull)));
        assert!(elapsed < Duration::from_millis(100), "try_submit took {elapsed:?}");

        let handles = background.join().unwrap();
        pipeline.stop();
        for handle in handles {
            assert!(handle.unwrap().try_outcome().unwrap().all_succeeded());
        }
        assert!(resizer.get_calls().iter().all(|c| !c.output.contains("fast")));
    }

    #[test]
    fn stop_releases_a_parked_submit_with_pipeline_closed() {
        let resizer = Arc::new(MockResizer::with_delay(Duration::from_millis(100)));
        let pipeline = Pipeline::new(settings(1, 1), resizer.clone());
        pipeline.start().unwrap();
        let background = with_parked_submitter(&pipeline, 2);

        let began = Instant::now();
        pipeline.stop();
        let results = background.join().unwrap();

        // The first picture alone keeps the one worker busy for 400ms
        assert!(began.elapsed() < Duration::from_secs(5));
        let first = results[0].as_ref().unwrap();
        assert!(first.try_outcome().unwrap().all_succeeded());
        assert!(matches!(results[1], Err(PipelineError::PipelineClosed)));
        assert_eq!(pipeline.stats().submitted, 1);
        assert!(resizer.get_calls().iter().all(|c| !c.output.contains("bg1")));
    }

    #[test]
    fn every_stop_caller_waits_for_the_drain() {
        let resizer = Arc::new(MockResizer::with_delay(Duration::from_millis(5)));
        let pipeline = Pipeline::new(settings(1, 64), resizer.clone());
        pipeline.start().unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let (p, v) = picture(&format!("pic{i}"));
                pipeline.submit(p, v).unwrap()
            })
            .collect();

        let first_stop = {
            let pipeline = pipeline.clone();
            thread::spawn(move || pipeline.stop())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pipeline.state(), LifecycleState::Stopping);
        pipeline.stop();

        assert_eq!(pipeline.state(), LifecycleState::Stopped);
        let stats = pipeline.stats();
        assert_eq!(stats.tasks_started, 30);
        assert_eq!(stats.tasks_finished, 30);
        assert_eq!(stats.queued, 0);
        assert!(handles.iter().all(CompletionHandle::is_complete));
        first_stop.join().unwrap();
    }

    /// Panics on the display-size output only.
    struct PanickingResizer;

    impl Resizer for PanickingResizer {
        fn resize(&self, request: &ResizeRequest) -> Result<(), ResizeError> {
            if request.output == std::path::Path::new("/pc/abc123.jpg") {
                panic!("decoder crashed");
            }
            Ok(())
        }
    }

    #[test]
    fn panicking_task_counts_as_finished() {
        let pipeline = Pipeline::new(settings(2, 4), Arc::new(PanickingResizer));
        pipeline.start().unwrap();

        let (p, v) = picture("abc123");
        let handle = pipeline.submit(p, v).unwrap();
        pipeline.stop();

        let outcome = handle.try_outcome().unwrap();
        assert_eq!(outcome.get(TaskKind::Processed), Some(&VariantOutcome::Abandoned));
        assert_eq!(outcome.get(TaskKind::Thumbnail), Some(&VariantOutcome::Succeeded));
        let stats = pipeline.stats();
        assert_eq!(stats.tasks_started, 3);
        assert_eq!(stats.tasks_finished, 3);
    }
}
