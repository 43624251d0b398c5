//! Bounded, ordered event stream from the scheduler to a display consumer.
//!
//! Publishing never drops silently: a full queue blocks the publisher for up to
//! the configured timeout, and events that still cannot be delivered are
//! counted. The next successful publish is preceded by an [`Event::Dropped`]
//! marker carrying the count and the type of the last dropped event.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::io::process::StreamKind;

/// Whether an output line matters to the user or is agent-internal noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLevel {
    Diagnostic,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub level: OutputLevel,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Generating,
    Generated {
        project_name: String,
        task_count: usize,
    },
    Loaded {
        project_name: String,
        completed: usize,
        total: usize,
    },
    TaskStarted {
        id: String,
        title: String,
        iteration: u32,
        completed: usize,
        total: usize,
    },
    TaskCompleted {
        id: String,
        success: bool,
        retry_count: i64,
    },
    Output(OutputLine),
    Error {
        message: String,
    },
    Completed {
        iterations: u32,
        total: usize,
    },
    Failed {
        reason: String,
    },
    /// Synthetic: `count` events were dropped; the last was of `last_kind`.
    Dropped {
        count: u64,
        last_kind: EventKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Generating,
    Generated,
    Loaded,
    TaskStarted,
    TaskCompleted,
    Output,
    Error,
    Completed,
    Failed,
    Dropped,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Generating => EventKind::Generating,
            Event::Generated { .. } => EventKind::Generated,
            Event::Loaded { .. } => EventKind::Loaded,
            Event::TaskStarted { .. } => EventKind::TaskStarted,
            Event::TaskCompleted { .. } => EventKind::TaskCompleted,
            Event::Output(_) => EventKind::Output,
            Event::Error { .. } => EventKind::Error,
            Event::Completed { .. } => EventKind::Completed,
            Event::Failed { .. } => EventKind::Failed,
            Event::Dropped { .. } => EventKind::Dropped,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Generating => "generating",
            EventKind::Generated => "generated",
            EventKind::Loaded => "loaded",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::Output => "output",
            EventKind::Error => "error",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

/// Create a bounded bus holding at most `capacity` undelivered events.
pub fn bounded(capacity: usize, publish_timeout: Duration) -> (EventPublisher, EventReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let publisher = EventPublisher {
        inner: Arc::new(Inner {
            tx,
            publish_timeout,
            drops: Mutex::new(DropState::default()),
        }),
    };
    (publisher, EventReceiver { rx })
}

#[derive(Debug, Default)]
struct DropState {
    pending: u64,
    last_kind: Option<EventKind>,
    total: u64,
}

impl DropState {
    fn record(&mut self, kind: EventKind) {
        self.pending += 1;
        self.total += 1;
        self.last_kind = Some(kind);
    }
}

#[derive(Debug)]
struct Inner {
    tx: SyncSender<Event>,
    publish_timeout: Duration,
    /// Also serializes publishers so emission order is delivery order.
    drops: Mutex<DropState>,
}

enum SendOutcome {
    Delivered,
    Full(Event),
    Disconnected,
}

/// Cloneable sending half. Safe to share between the scheduler and output
/// reader threads.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    /// Publish `event`, blocking up to the publish timeout while the queue is
    /// full. Returns `false` if the event was dropped or nobody is listening.
    ///
    /// Once an event has been dropped, later publishes do not wait: they try
    /// to deliver the drop marker and drop immediately while the queue stays
    /// full. A stalled consumer therefore costs one timeout per stall.
    pub fn publish(&self, event: Event) -> bool {
        let mut drops = self
            .inner
            .drops
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if drops.pending > 0 {
            let marker = Event::Dropped {
                count: drops.pending,
                last_kind: drops.last_kind.unwrap_or(EventKind::Output),
            };
            match self.inner.tx.try_send(marker) {
                Ok(()) => {
                    drops.pending = 0;
                    drops.last_kind = None;
                }
                Err(TrySendError::Full(_)) => {
                    // Delivering `event` now would put it ahead of the marker
                    // that accounts for earlier drops.
                    let kind = event.kind();
                    drops.record(kind);
                    warn!(
                        kind = %kind,
                        dropped_total = drops.total,
                        "event queue still full, dropping event"
                    );
                    return false;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }

        match self.send_with_timeout(event) {
            SendOutcome::Delivered => true,
            SendOutcome::Full(event) => {
                let kind = event.kind();
                drops.record(kind);
                warn!(kind = %kind, dropped_total = drops.total, "event queue full, dropping event");
                false
            }
            SendOutcome::Disconnected => {
                debug!("event receiver gone, discarding event");
                false
            }
        }
    }

    /// Total events dropped since the bus was created.
    pub fn dropped_total(&self) -> u64 {
        self.inner
            .drops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(Event::Error {
            message: message.into(),
        });
    }

    fn send_with_timeout(&self, event: Event) -> SendOutcome {
        let deadline = Instant::now() + self.inner.publish_timeout;
        let mut event = event;
        loop {
            match self.inner.tx.try_send(event) {
                Ok(()) => return SendOutcome::Delivered,
                Err(TrySendError::Disconnected(_)) => return SendOutcome::Disconnected,
                Err(TrySendError::Full(back)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return SendOutcome::Full(back);
                    }
                    event = back;
                    std::thread::sleep((deadline - now).min(Duration::from_millis(2)));
                }
            }
        }
    }
}

/// Receiving half, owned by the display consumer.
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<Event>,
}

impl EventReceiver {
    /// Block for the next event; `None` once every publisher is dropped.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}

impl Iterator for EventReceiver {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.recv()
    }
}
