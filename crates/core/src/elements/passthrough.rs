use super::NodeCore;
use crate::{
    error::PropertyError,
    graph::NodeContext,
    node::{Caps, Node, ObjectId, PadSpec, PropertyValue, State, TransitionOutcome},
};

/// Converters, resamplers and sinks. They only exist to give the graph a
/// realistic shape, so every transition settles synchronously.
#[derive(Debug)]
pub struct Passthrough {
    core: NodeCore,
    pads: Vec<PadSpec>,
}

impl Passthrough {
    pub fn audio_filter(kind: &'static str, name: &str) -> Self {
        Self {
            core: NodeCore::new(kind, name, &[]),
            pads: vec![
                PadSpec::sink("sink", Some(Caps::new("audio/x-raw"))),
                PadSpec::src("src", Some(Caps::new("audio/x-raw"))),
            ],
        }
    }

    pub fn sink(kind: &'static str, name: &str, media_type: &str) -> Self {
        Self {
            core: NodeCore::new(kind, name, &[("sync", PropertyValue::Bool(true))]),
            pads: vec![PadSpec::sink("sink", Some(Caps::new(media_type)))],
        }
    }
}

impl Node for Passthrough {
    fn id(&self) -> ObjectId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> &str {
        self.core.kind()
    }

    fn static_pads(&self) -> Vec<PadSpec> {
        self.pads.clone()
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<(), PropertyError> {
        self.core.set_property(name, value)
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        self.core.property(name)
    }

    fn attach(&self, ctx: NodeContext) {
        self.core.attach(ctx);
    }

    fn detach(&self) {
        self.core.detach();
    }

    fn state(&self) -> State {
        self.core.state()
    }

    fn request_state(&self, target: State) -> TransitionOutcome {
        self.core.transition_sync(target)
    }
}
