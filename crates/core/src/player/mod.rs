//! Playback controller for a single URI.
//!
//! Everything here runs on the control thread: bus events and poll ticks
//! both arrive through [`Controller`], so the state machine, the position
//! coordinator and the stream catalogue need no locking.

use crate::{
    bridge::StreamCatalog,
    bus::{Event, EventSource},
    config::ResolverConfig,
    control::{Controller, Flow, TimerAction, TimerId},
    elements::{self, AUDIO_CONVERT, AUDIO_RESAMPLE, AUDIO_SINK, URI_DECODER},
    error::TransitionError,
    graph::Graph,
    node::{PadId, State, TransitionOutcome},
    resolver::LinkResolver,
    state::{StateChange, StateMachine},
    timeline::{PositionCoordinator, PositionSnapshot, SeekPolicy},
    Result,
};

/// Presentation side of the player. Called on the control thread only.
pub trait PlayerView {
    fn refresh(&mut self, snapshot: &PositionSnapshot);

    fn streams_changed(&mut self, catalog: &StreamCatalog) {
        let _ = catalog;
    }

    fn stream_error(&mut self, source: &EventSource, message: &str, debug_info: Option<&str>) {
        let _ = (source, message, debug_info);
    }
}

/// Why a session stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    StreamError,
}

/// Builds `uridecoder -> audioconvert -> audioresample -> audiosink` and
/// installs a resolver for the decoder's runtime pads.
pub fn build_playback_graph(graph: &Graph, uri: &str, resolver: &ResolverConfig) -> Result<()> {
    let source = elements::make(URI_DECODER, "source")?;
    let convert = elements::make(AUDIO_CONVERT, "convert")?;
    let resample = elements::make(AUDIO_RESAMPLE, "resample")?;
    let sink = elements::make(AUDIO_SINK, "sink")?;
    source.set_property("uri", uri.into())?;

    graph.add_node(source)?;
    let convert = graph.add_node(convert)?;
    let resample = graph.add_node(resample)?;
    let sink = graph.add_node(sink)?;
    graph.link_many(&[convert, resample, sink])?;

    LinkResolver::new(
        PadId::new(convert, "sink"),
        resolver.accepted_prefixes.iter().cloned(),
    )
    .install(graph);
    tracing::debug!(graph = graph.name(), uri, "playback graph ready");
    Ok(())
}

#[derive(Debug)]
pub struct Player<V> {
    machine: StateMachine,
    position: PositionCoordinator,
    catalog: StreamCatalog,
    view: V,
    ended: Option<SessionEnd>,
}

impl<V: PlayerView> Player<V> {
    pub fn new(graph: &Graph, policy: SeekPolicy, view: V) -> Self {
        Self {
            machine: StateMachine::new(graph.id()),
            position: PositionCoordinator::new(policy),
            catalog: StreamCatalog::new(),
            view,
            ended: None,
        }
    }

    /// Requests PLAYING. Startup failures are fatal to the session.
    pub fn start(&mut self, graph: &Graph) -> std::result::Result<TransitionOutcome, TransitionError> {
        self.machine.request(graph, State::Playing)
    }

    pub fn state(&self) -> &StateMachine {
        &self.machine
    }

    pub fn position(&self) -> &PositionCoordinator {
        &self.position
    }

    pub fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn ended(&self) -> Option<SessionEnd> {
        self.ended
    }

    fn refresh(&mut self, graph: &Graph) {
        let sampled = self.position.sample(graph);
        if self.machine.is_playing() {
            if let Some(position) = sampled.position {
                if let Some(Err(err)) = self.position.apply_policy(graph, position) {
                    tracing::warn!(%err, "seek failed");
                }
            }
        }
        let snapshot = self.position.snapshot(sampled.position);
        self.view.refresh(&snapshot);
    }

    fn on_state_change(&mut self, graph: &Graph, change: StateChange) {
        if change.new == State::Playing {
            self.position.query_seek_capability(graph);
        }
        if change.old == State::Ready && change.new == State::Paused {
            self.refresh(graph);
        }
    }
}

impl<V: PlayerView> Controller for Player<V> {
    fn on_event(&mut self, graph: &Graph, event: Event) -> Flow {
        match &event {
            Event::EndOfStream { .. } => {
                tracing::info!("end-of-stream reached");
                if let Err(err) = self.machine.request(graph, State::Ready) {
                    tracing::warn!(%err, "could not stop after end-of-stream");
                }
                self.ended = Some(SessionEnd::EndOfStream);
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
                self.view
                    .stream_error(source, message, debug_info.as_deref());
                if let Err(err) = self.machine.request(graph, State::Null) {
                    tracing::warn!(%err, "could not shut the graph down");
                }
                self.ended = Some(SessionEnd::StreamError);
                Flow::Stop
            }
            Event::StateChanged { .. } => {
                if let Some(change) = self.machine.apply(&event) {
                    self.on_state_change(graph, change);
                }
                Flow::Continue
            }
            Event::DurationInvalidated { .. } => {
                self.position.invalidate_duration();
                Flow::Continue
            }
            // The graph's own async-done closes a state change; only the
            // node that flushed can confirm a seek.
            Event::AsyncDone { source } if source.id == graph.id() => {
                tracing::debug!(graph = graph.name(), "async state change settled");
                Flow::Continue
            }
            Event::AsyncDone { .. } => {
                self.position.seek_completed();
                Flow::Continue
            }
            Event::Application { tag, .. } => {
                match self.catalog.handle(&event) {
                    Ok(true) => self.view.streams_changed(&self.catalog),
                    Ok(false) => tracing::debug!(tag = %tag, "unhandled application event"),
                    Err(err) => tracing::warn!(%err, tag = %tag, "malformed application event"),
                }
                Flow::Continue
            }
        }
    }

    fn on_timer(&mut self, graph: &Graph, _timer: TimerId) -> TimerAction {
        if self.ended.is_some() {
            return TimerAction::Cancel;
        }
        if self.machine.current() < State::Paused {
            return TimerAction::Rearm;
        }
        self.refresh(graph);
        TimerAction::Rearm
    }
}
