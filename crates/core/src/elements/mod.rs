//! Simulated processing elements behind a kind-keyed factory.
//!
//! None of these decode or render anything. They reproduce the observable
//! behaviour the controller has to cope with: async preroll on a worker
//! thread, pads that appear at runtime, a clock that advances on its own and
//! end-of-stream arriving from a thread the controller does not own.

mod decoder;
mod passthrough;
mod test_source;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub use decoder::UriDecoder;
pub use passthrough::Passthrough;
pub use test_source::TestSource;

use crate::{
    error::{ConstructionError, PropertyError},
    graph::{lock, NodeContext},
    node::{Node, ObjectId, PropertyValue, State, TransitionOutcome},
};

pub const URI_DECODER: &str = "uridecoder";
pub const TEST_SOURCE: &str = "testsrc";
pub const AUDIO_CONVERT: &str = "audioconvert";
pub const AUDIO_RESAMPLE: &str = "audioresample";
pub const AUDIO_SINK: &str = "audiosink";
pub const VIDEO_SINK: &str = "videosink";

/// Creates a node of the given kind.
pub fn make(kind: &str, name: &str) -> Result<Arc<dyn Node>, ConstructionError> {
    if name.is_empty() {
        return Err(ConstructionError::Failed {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: "node names must not be empty".to_string(),
        });
    }
    let node: Arc<dyn Node> = match kind {
        URI_DECODER => Arc::new(UriDecoder::new(name)),
        TEST_SOURCE => Arc::new(TestSource::new(name)),
        AUDIO_CONVERT => Arc::new(Passthrough::audio_filter(AUDIO_CONVERT, name)),
        AUDIO_RESAMPLE => Arc::new(Passthrough::audio_filter(AUDIO_RESAMPLE, name)),
        AUDIO_SINK => Arc::new(Passthrough::sink(AUDIO_SINK, name, "audio/x-raw")),
        VIDEO_SINK => Arc::new(Passthrough::sink(VIDEO_SINK, name, "video/x-raw")),
        other => return Err(ConstructionError::UnknownKind(other.to_string())),
    };
    tracing::debug!(kind, name, "created node");
    Ok(node)
}

/// Bookkeeping every element shares: identity, state, properties and the
/// context handed over by the graph.
#[derive(Debug)]
pub(crate) struct NodeCore {
    id: ObjectId,
    name: String,
    kind: &'static str,
    state: Mutex<State>,
    ctx: Mutex<Option<NodeContext>>,
    properties: Mutex<BTreeMap<String, PropertyValue>>,
}

impl NodeCore {
    pub(crate) fn new(kind: &'static str, name: &str, defaults: &[(&str, PropertyValue)]) -> Self {
        Self {
            id: ObjectId::next(),
            name: name.to_string(),
            kind,
            state: Mutex::new(State::Null),
            ctx: Mutex::new(None),
            properties: Mutex::new(
                defaults
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.clone()))
                    .collect(),
            ),
        }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }

    /// Only declared properties can be set, and only with their declared type.
    pub(crate) fn set_property(&self, name: &str, value: PropertyValue) -> Result<(), PropertyError> {
        let mut properties = lock(&self.properties);
        let slot = properties.get_mut(name).ok_or_else(|| PropertyError::Unknown {
            node: self.name.clone(),
            name: name.to_string(),
        })?;
        if std::mem::discriminant(slot) != std::mem::discriminant(&value) {
            return Err(PropertyError::WrongType {
                node: self.name.clone(),
                name: name.to_string(),
                expected: slot.type_name(),
            });
        }
        tracing::debug!(node = %self.name, property = name, %value, "property set");
        *slot = value;
        Ok(())
    }

    pub(crate) fn property(&self, name: &str) -> Option<PropertyValue> {
        lock(&self.properties).get(name).cloned()
    }

    pub(crate) fn int(&self, name: &str) -> i64 {
        self.property(name)
            .and_then(|value| value.as_int())
            .unwrap_or_default()
    }

    pub(crate) fn bool(&self, name: &str) -> bool {
        self.property(name)
            .and_then(|value| value.as_bool())
            .unwrap_or_default()
    }

    pub(crate) fn string(&self, name: &str) -> String {
        self.property(name)
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub(crate) fn attach(&self, ctx: NodeContext) {
        *lock(&self.ctx) = Some(ctx);
    }

    pub(crate) fn detach(&self) {
        *lock(&self.ctx) = None;
    }

    pub(crate) fn ctx(&self) -> Option<NodeContext> {
        lock(&self.ctx).clone()
    }

    pub(crate) fn state(&self) -> State {
        *lock(&self.state)
    }

    /// Moves one step and reports it. The state lock is released before the
    /// graph hears about it.
    pub(crate) fn commit(&self, new: State, pending: Option<State>) {
        let old = std::mem::replace(&mut *lock(&self.state), new);
        if old == new {
            return;
        }
        if let Some(ctx) = self.ctx() {
            ctx.commit_state(old, new, pending);
        }
    }

    /// Walks every step to `target` synchronously.
    pub(crate) fn transition_sync(&self, target: State) -> TransitionOutcome {
        for (_, next) in self.state().steps_to(target) {
            self.commit(next, (next != target).then_some(target));
        }
        TransitionOutcome::Success
    }
}

/// Running position of a simulated stream.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamClock {
    base: Duration,
    started: Option<Instant>,
}

impl StreamClock {
    pub(crate) fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub(crate) fn pause(&mut self) {
        self.base = self.position();
        self.started = None;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn seek(&mut self, target: Duration) {
        self.base = target;
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
    }

    pub(crate) fn position(&self) -> Duration {
        self.base + self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }
}
