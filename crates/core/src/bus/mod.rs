//! Thread-safe event bus between worker threads and the control thread.
//!
//! Any number of [`BusSender`] clones may post concurrently; exactly one
//! [`EventBus`] drains. Events from one producer keep their posting order and
//! each event is handed out once.

use std::{fmt, time::Duration};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::{error::BusError, node::ObjectId, node::State};

/// Identity of whatever posted an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSource {
    pub id: ObjectId,
    pub name: String,
}

impl EventSource {
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Immutable notification carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    EndOfStream {
        source: EventSource,
    },
    Error {
        source: EventSource,
        message: String,
        debug_info: Option<String>,
    },
    StateChanged {
        source: EventSource,
        old: State,
        new: State,
        /// Final state of a multi-step change still in progress.
        pending: Option<State>,
    },
    DurationInvalidated {
        source: EventSource,
    },
    /// An asynchronous operation (preroll, flushing seek) has settled.
    AsyncDone {
        source: EventSource,
    },
    /// Self-posted notification used to re-enter the control thread.
    Application {
        source: EventSource,
        tag: String,
        payload: serde_json::Value,
    },
}

impl Event {
    pub fn source(&self) -> &EventSource {
        match self {
            Event::EndOfStream { source }
            | Event::Error { source, .. }
            | Event::StateChanged { source, .. }
            | Event::DurationInvalidated { source }
            | Event::AsyncDone { source }
            | Event::Application { source, .. } => source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::EndOfStream { .. } => "eos",
            Event::Error { .. } => "error",
            Event::StateChanged { .. } => "state-changed",
            Event::DurationInvalidated { .. } => "duration-changed",
            Event::AsyncDone { .. } => "async-done",
            Event::Application { .. } => "application",
        }
    }
}

/// An event together with its position in the delivery sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub seq: u64,
    pub event: Event,
}

/// Posting half of the bus. Cheap to clone and safe to move to any thread.
#[derive(Clone)]
pub struct BusSender {
    tx: Sender<Event>,
}

impl BusSender {
    pub fn post(&self, event: Event) -> Result<(), BusError> {
        tracing::trace!(kind = event.kind(), source = %event.source(), "posting event");
        self.tx.send(event).map_err(|_| BusError::Closed)
    }
}

impl fmt::Debug for BusSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSender")
            .field("queued", &self.tx.len())
            .finish()
    }
}

/// Draining half of the bus, owned by the control thread.
pub struct EventBus {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    delivered: u64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            delivered: 0,
        }
    }

    pub fn sender(&self) -> BusSender {
        BusSender {
            tx: self.tx.clone(),
        }
    }

    /// Posts from the control thread itself. The event is handled on a later
    /// dispatch iteration, never re-entrantly.
    pub fn post(&self, event: Event) {
        // The bus owns a sender, so the channel cannot be disconnected here.
        let _ = self.tx.send(event);
    }

    /// Blocks for at most `timeout` waiting for the next event.
    pub fn pop_timeout(&mut self, timeout: Duration) -> Option<Delivered> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(self.deliver(event)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&mut self) -> Option<Delivered> {
        self.rx.try_recv().ok().map(|event| self.deliver(event))
    }

    /// Number of events waiting to be dispatched.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Number of events handed out so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Discards everything queued and returns how many events were dropped.
    pub fn flush(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    fn deliver(&mut self, event: Event) -> Delivered {
        self.delivered += 1;
        Delivered {
            seq: self.delivered,
            event,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("queued", &self.rx.len())
            .field("delivered", &self.delivered)
            .finish()
    }
}
