//! Event bus
//!
//! Delivers job state snapshots from the background monitoring threads to
//! the presentation layer. Publishing clones the event to every subscriber
//! over an unbounded mpsc channel, so a slow or unresponsive consumer never
//! stalls a job's output draining. Delivery is at-least-once per state
//! transition; consumers treat events as idempotent snapshots and apply the
//! latest by `(job, seq)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::jobs::JobRecord;

/// One job state snapshot delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Full snapshot of the job at the time of the transition
    pub job: JobRecord,
    /// Per-job sequence number; later events for the same job have a
    /// strictly greater value, so duplicates and reordering are harmless
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub(crate) fn new(job: JobRecord, seq: u64) -> Self {
        Self {
            job,
            seq,
            timestamp: Utc::now(),
        }
    }
}

/// Single-producer-many-consumer snapshot delivery.
///
/// Holds no job state of its own, only the subscriber channel ends.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<JobEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer and return its receiving end.
    ///
    /// Dropping the receiver unsubscribes; the dead channel is pruned on
    /// the next publish.
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    ///
    /// Sends are unbounded and never block; subscribers whose receiver has
    /// been dropped are removed.
    pub fn publish(&self, event: &JobEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of currently registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}
