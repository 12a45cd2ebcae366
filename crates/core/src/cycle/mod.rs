//! Replaces a running source at a fixed interval without stopping the graph.
//!
//! The swap happens on the control thread inside a timer tick: the old source
//! goes to NULL, is unlinked and removed, and a fresh one is added, linked to
//! the same sink and brought up to the graph's target state. The sink and its
//! link count are untouched throughout.

use std::sync::Arc;

use crate::{
    bus::Event,
    config::CycleConfig,
    control::{Controller, Flow, TimerAction, TimerId},
    elements::{self, TEST_SOURCE, VIDEO_SINK},
    error::TransitionError,
    graph::Graph,
    node::{Node, ObjectId, State, TransitionOutcome},
    state::StateMachine,
    Result,
};

pub const SOURCE_NAME: &str = "source";

fn make_source(pattern: u32, is_live: bool) -> Result<Arc<dyn Node>> {
    let source = elements::make(TEST_SOURCE, SOURCE_NAME)?;
    source.set_property("pattern", i64::from(pattern).into())?;
    source.set_property("is-live", is_live.into())?;
    Ok(source)
}

/// Builds `testsrc -> videosink` and returns the sink's id.
pub fn build_cycle_graph(graph: &Graph, config: &CycleConfig) -> Result<ObjectId> {
    let source = graph.add_node(make_source(0, config.is_live)?)?;
    let sink = graph.add_node(elements::make(VIDEO_SINK, "sink")?)?;
    graph.link_nodes(source, sink)?;
    Ok(sink)
}

#[derive(Debug)]
pub struct SourceCycler {
    machine: StateMachine,
    sink: ObjectId,
    pattern: u32,
    pattern_count: u32,
    is_live: bool,
    swaps: u32,
    limit: Option<u32>,
    ended: bool,
}

impl SourceCycler {
    pub fn new(graph: &Graph, sink: ObjectId, config: &CycleConfig) -> Self {
        Self {
            machine: StateMachine::new(graph.id()),
            sink,
            pattern: 0,
            pattern_count: config.pattern_count.max(1),
            is_live: config.is_live,
            swaps: 0,
            limit: None,
            ended: false,
        }
    }

    /// Ends the session with end-of-stream after `swaps` replacements.
    pub fn with_limit(mut self, swaps: u32) -> Self {
        self.limit = Some(swaps);
        self
    }

    pub fn start(&mut self, graph: &Graph) -> std::result::Result<TransitionOutcome, TransitionError> {
        self.machine.request(graph, State::Playing)
    }

    pub fn state(&self) -> &StateMachine {
        &self.machine
    }

    pub fn pattern(&self) -> u32 {
        self.pattern
    }

    pub fn swaps(&self) -> u32 {
        self.swaps
    }

    /// Swaps in a source with the next pattern and returns its id.
    pub fn swap_source(&mut self, graph: &Graph) -> Result<ObjectId> {
        if let Some(old) = graph.node_by_name(SOURCE_NAME) {
            graph.quiesce_node(old.id())?;
            graph.remove_node(old.id())?;
        }

        let pattern = (self.pattern + 1) % self.pattern_count;
        let source = graph.add_node(make_source(pattern, self.is_live)?)?;
        graph.link_nodes(source, self.sink)?;
        if graph.sync_node_state(source) == TransitionOutcome::Failure {
            return Err(TransitionError::Failure {
                name: SOURCE_NAME.to_string(),
                target: graph.target_state(),
            }
            .into());
        }

        self.pattern = pattern;
        self.swaps += 1;
        tracing::info!(pattern, "switched to a new source");
        Ok(source)
    }
}

impl Controller for SourceCycler {
    fn on_event(&mut self, graph: &Graph, event: Event) -> Flow {
        match &event {
            Event::EndOfStream { .. } => {
                tracing::info!("end-of-stream reached");
                self.ended = true;
                Flow::Stop
            }
            Event::Error {
                source,
                message,
                debug_info,
            } => {
                tracing::error!(
                    source = %source,
                    debug = debug_info.as_deref().unwrap_or("none"),
                    "error received: {message}"
                );
                if let Err(err) = self.machine.request(graph, State::Null) {
                    tracing::warn!(%err, "could not shut the graph down");
                }
                self.ended = true;
                Flow::Stop
            }
            Event::StateChanged { .. } => {
                self.machine.apply(&event);
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn on_timer(&mut self, graph: &Graph, _timer: TimerId) -> TimerAction {
        if self.ended {
            return TimerAction::Cancel;
        }
        if !self.machine.is_playing() {
            return TimerAction::Rearm;
        }
        match self.swap_source(graph) {
            Ok(_) if self.limit.is_some_and(|limit| self.swaps >= limit) => {
                graph.post(Event::EndOfStream {
                    source: graph.source(),
                });
                TimerAction::Cancel
            }
            Ok(_) => TimerAction::Rearm,
            Err(err) => {
                tracing::error!(%err, "source swap failed");
                TimerAction::Cancel
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::EventBus, node::PropertyValue};

    fn running() -> (EventBus, Graph, SourceCycler) {
        let mut bus = EventBus::new();
        let graph = Graph::new("pipeline", bus.sender());
        let config = CycleConfig {
            pattern_count: 3,
            ..CycleConfig::default()
        };
        let sink = build_cycle_graph(&graph, &config).unwrap();
        let mut cycler = SourceCycler::new(&graph, sink, &config);
        assert_eq!(cycler.start(&graph), Ok(TransitionOutcome::Success));
        while let Some(delivered) = bus.try_pop() {
            cycler.on_event(&graph, delivered.event);
        }
        (bus, graph, cycler)
    }

    #[test]
    fn timer_swaps_only_while_playing() {
        let (_bus, graph, mut cycler) = running();
        assert!(cycler.state().is_playing());
        assert_eq!(cycler.on_timer(&graph, TimerId(0)), TimerAction::Rearm);
        assert_eq!(cycler.swaps(), 1);

        cycler.on_event(
            &graph,
            Event::EndOfStream {
                source: graph.source(),
            },
        );
        assert_eq!(cycler.on_timer(&graph, TimerId(0)), TimerAction::Cancel);
        assert_eq!(cycler.swaps(), 1);
    }

    #[test]
    fn patterns_wrap_and_new_sources_stay_live() {
        let (_bus, graph, mut cycler) = running();
        let patterns: Vec<u32> = (0..4)
            .map(|_| {
                cycler.swap_source(&graph).unwrap();
                cycler.pattern()
            })
            .collect();
        assert_eq!(patterns, vec![1, 2, 0, 1]);

        let source = graph.node_by_name(SOURCE_NAME).unwrap();
        assert_eq!(source.property("is-live"), Some(PropertyValue::Bool(true)));
        assert_eq!(source.property("pattern"), Some(PropertyValue::Int(1)));
        assert_eq!(source.state(), State::Playing);
        assert_eq!(graph.nodes().len(), 2);
    }

    #[test]
    fn swap_limit_ends_the_session() {
        let (mut bus, graph, cycler) = running();
        let mut cycler = cycler.with_limit(2);
        assert_eq!(cycler.on_timer(&graph, TimerId(0)), TimerAction::Rearm);
        assert_eq!(cycler.on_timer(&graph, TimerId(0)), TimerAction::Cancel);

        let mut flow = Flow::Continue;
        while let Some(delivered) = bus.try_pop() {
            flow = cycler.on_event(&graph, delivered.event);
        }
        assert_eq!(flow, Flow::Stop);
    }
}
