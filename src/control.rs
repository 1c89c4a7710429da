//! Centralised log and error reporting for tasks.
//!
//! Workers never log directly. They publish [`ControlEvent`]s into a
//! [`ControlChannel`], and one background loop ([`run_sink`]) hands them to
//! an [`EventSink`], by default [`TracingSink`].
//!
//! Publishing never blocks. The channel is bounded; when it is full the
//! oldest buffered event is evicted to make room for the new one and the
//! eviction is counted in [`ControlChannel::dropped`]. A slow sink therefore
//! costs log lines, never worker throughput.

use crate::task::TaskKind;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Give up on a publish after this many evictions lost the race to other
/// producers; the event is then counted as dropped.
const MAX_EVICTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Log,
    Error,
}

/// One log line or error from a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlEvent {
    pub level: EventLevel,
    pub kind: Option<TaskKind>,
    pub picture: Option<String>,
    pub message: String,
}

impl ControlEvent {
    pub fn log(kind: Option<TaskKind>, picture: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Log,
            kind,
            picture: picture.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn error(kind: Option<TaskKind>, picture: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Error,
            ..Self::log(kind, picture, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == EventLevel::Error
    }
}

/// Where control events end up.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ControlEvent);
}

/// Forwards events to `tracing`: log lines at INFO, errors at ERROR.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn deliver(&self, event: ControlEvent) {
        let kind = event.kind.map(|k| k.to_string()).unwrap_or_default();
        let picture = event.picture.as_deref().unwrap_or("-");
        match event.level {
            EventLevel::Log => {
                tracing::info!(kind = %kind, picture = %picture, "{}", event.message)
            }
            EventLevel::Error => {
                tracing::error!(kind = %kind, picture = %picture, "{}", event.message)
            }
        }
    }
}

/// Bounded, drop-oldest event buffer shared by every task.
#[derive(Debug)]
pub struct ControlChannel {
    tx: Sender<ControlEvent>,
    // Kept for the sink loop and for evicting the oldest event on overflow
    rx: Receiver<ControlEvent>,
    dropped: AtomicU64,
}

impl ControlChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: ControlEvent) {
        let mut event = event;
        for _ in 0..MAX_EVICTIONS {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    event = back;
                }
                // Unreachable while `self.rx` lives
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log(&self, kind: TaskKind, picture: &str, message: impl Into<String>) {
        self.publish(ControlEvent::log(Some(kind), Some(picture), message));
    }

    pub fn error(&self, kind: TaskKind, picture: &str, message: impl Into<String>) {
        self.publish(ControlEvent::error(Some(kind), Some(picture), message));
    }

    /// Events lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Take everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<ControlEvent> {
        self.rx.try_iter().collect()
    }

    pub(crate) fn receiver(&self) -> Receiver<ControlEvent> {
        self.rx.clone()
    }
}

/// Deliver events until `shutdown` fires, then flush what is left.
///
/// `shutdown` is a broadcast-once signal: its sender is dropped, never sent on.
pub fn run_sink(events: Receiver<ControlEvent>, shutdown: Receiver<()>, sink: &dyn EventSink) {
    loop {
        crossbeam::select! {
            recv(events) -> event => match event {
                Ok(event) => sink.deliver(event),
                Err(_) => return,
            },
            recv(shutdown) -> _ => break,
        }
    }
    for event in events.try_iter() {
        sink.deliver(event);
    }
}
