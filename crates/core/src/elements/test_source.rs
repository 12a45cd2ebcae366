use std::{sync::Mutex, time::Duration};

use super::{lock, NodeCore, StreamClock, TEST_SOURCE};
use crate::{
    error::PropertyError,
    graph::NodeContext,
    node::{Caps, Node, ObjectId, PadSpec, PropertyValue, State, TransitionOutcome},
    timeline::SeekCapability,
};

/// Pattern generator with a single static video pad.
///
/// When `is-live` is set it produces nothing while PAUSED and answers
/// `NoPreroll`, like any capture device would.
#[derive(Debug)]
pub struct TestSource {
    core: NodeCore,
    clock: Mutex<StreamClock>,
}

impl TestSource {
    pub fn new(name: &str) -> Self {
        Self {
            core: NodeCore::new(
                TEST_SOURCE,
                name,
                &[
                    ("pattern", PropertyValue::Int(0)),
                    ("is-live", PropertyValue::Bool(false)),
                ],
            ),
            clock: Mutex::new(StreamClock::default()),
        }
    }

    fn is_live(&self) -> bool {
        self.core.bool("is-live")
    }
}

impl Node for TestSource {
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
        vec![PadSpec::src("src", Some(Caps::new("video/x-raw")))]
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
        let current = self.core.state();
        if current == target {
            return TransitionOutcome::Success;
        }

        for (_, next) in current.steps_to(target) {
            {
                let mut clock = lock(&self.clock);
                match next {
                    State::Playing => clock.start(),
                    State::Paused if current == State::Playing => clock.pause(),
                    State::Ready => clock.reset(),
                    _ => {}
                }
            }
            if next == State::Paused && current < State::Paused {
                tracing::debug!(
                    node = self.core.name(),
                    pattern = self.core.int("pattern"),
                    "generating pattern"
                );
            }
            self.core.commit(next, (next != target).then_some(target));
        }

        if target == State::Paused && self.is_live() {
            TransitionOutcome::NoPreroll
        } else {
            TransitionOutcome::Success
        }
    }

    fn query_position(&self) -> Option<Duration> {
        (self.core.state() >= State::Paused).then(|| lock(&self.clock).position())
    }

    fn query_seeking(&self) -> Option<SeekCapability> {
        (self.core.state() >= State::Paused).then(SeekCapability::unseekable)
    }
}
