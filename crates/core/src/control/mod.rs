//! Context object and the cooperative dispatch loop of the control thread.
//!
//! The loop waits for the next event or the next timer deadline, whichever
//! comes first, runs exactly one handler to completion and repeats. Waiting
//! on the bus is the only place the control thread blocks.

use std::time::{Duration, Instant};

use crate::{
    bus::{BusSender, Event, EventBus},
    graph::Graph,
    node::State,
};

/// Upper bound on a single wait when no timer is registered.
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Rearm,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

/// Control-thread consumer of bus events and timer ticks. Handlers must not
/// block.
pub trait Controller {
    fn on_event(&mut self, graph: &Graph, event: Event) -> Flow;

    fn on_timer(&mut self, graph: &Graph, timer: TimerId) -> TimerAction {
        let _ = (graph, timer);
        TimerAction::Cancel
    }
}

#[derive(Debug)]
struct Timer {
    id: TimerId,
    interval: Duration,
    due: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub events: u64,
    pub ticks: u64,
}

/// Owns the bus, the graph and the timer registrations for one session.
#[derive(Debug)]
pub struct Context {
    bus: EventBus,
    graph: Graph,
    timers: Vec<Timer>,
    next_timer: usize,
    summary: RunSummary,
}

impl Context {
    pub fn new(graph_name: impl Into<String>) -> Self {
        let bus = EventBus::new();
        let graph = Graph::new(graph_name, bus.sender());
        Self {
            bus,
            graph,
            timers: Vec::new(),
            next_timer: 0,
            summary: RunSummary::default(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn bus_sender(&self) -> BusSender {
        self.bus.sender()
    }

    /// Self-posts an event for a later iteration.
    pub fn post(&self, event: Event) {
        self.bus.post(event);
    }

    /// Registers a periodic timer; the first tick fires one interval from now.
    pub fn add_timer(&mut self, interval: Duration) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.push(Timer {
            id,
            interval,
            due: Instant::now() + interval,
        });
        id
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.retain(|timer| timer.id != id);
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Runs one wait/dispatch cycle.
    pub fn iterate<C: Controller>(&mut self, controller: &mut C) -> Flow {
        self.fire_due_timers(controller);

        let wait = self
            .timers
            .iter()
            .map(|timer| timer.due)
            .min()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        match self.bus.pop_timeout(wait) {
            Some(delivered) => {
                self.summary.events += 1;
                tracing::trace!(seq = delivered.seq, kind = delivered.event.kind(), "dispatching");
                controller.on_event(&self.graph, delivered.event)
            }
            None => Flow::Continue,
        }
    }

    /// Dispatches until a handler answers [`Flow::Stop`].
    pub fn run<C: Controller>(&mut self, controller: &mut C) -> RunSummary {
        tracing::debug!(graph = self.graph.name(), "entering dispatch loop");
        while self.iterate(controller) == Flow::Continue {}
        tracing::debug!(
            events = self.summary.events,
            ticks = self.summary.ticks,
            "dispatch loop finished"
        );
        self.summary
    }

    /// Stops the graph and drops whatever is still queued.
    pub fn teardown(mut self) -> RunSummary {
        self.timers.clear();
        self.graph.request_state(State::Null);
        let dropped = self.bus.flush();
        tracing::debug!(dropped, graph = self.graph.name(), "context torn down");
        self.summary
    }

    fn fire_due_timers<C: Controller>(&mut self, controller: &mut C) {
        let now = Instant::now();
        let mut cancelled = Vec::new();
        for timer in self.timers.iter_mut().filter(|timer| timer.due <= now) {
            self.summary.ticks += 1;
            match controller.on_timer(&self.graph, timer.id) {
                TimerAction::Rearm => {
                    timer.due += timer.interval;
                    if timer.due <= now {
                        timer.due = now + timer.interval;
                    }
                }
                TimerAction::Cancel => cancelled.push(timer.id),
            }
        }
        self.timers.retain(|timer| !cancelled.contains(&timer.id));
    }
}
