use crate::{
    bus::Event,
    error::TransitionError,
    graph::Graph,
    node::{ObjectId, State, TransitionOutcome},
};

/// A confirmed top-level transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: State,
    pub new: State,
    pub pending: Option<State>,
}

/// Control-thread view of the graph's lifecycle.
///
/// Only `StateChanged` events whose source is the graph itself move the
/// tracked state; children report through the same bus but are informational.
#[derive(Debug)]
pub struct StateMachine {
    graph: ObjectId,
    current: State,
    target: State,
    pending: Option<State>,
}

impl StateMachine {
    pub fn new(graph: ObjectId) -> Self {
        Self {
            graph,
            current: State::Null,
            target: State::Null,
            pending: None,
        }
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn target(&self) -> State {
        self.target
    }

    /// Final state of an unconfirmed transition.
    pub fn pending(&self) -> Option<State> {
        self.pending
    }

    pub fn is_playing(&self) -> bool {
        self.current == State::Playing
    }

    /// Requests a top-level transition. `Async` means the new state must not
    /// be assumed until a matching `StateChanged` arrives.
    pub fn request(
        &mut self,
        graph: &Graph,
        target: State,
    ) -> Result<TransitionOutcome, TransitionError> {
        let outcome = graph.request_state(target);
        match outcome {
            TransitionOutcome::Failure => {
                tracing::error!(graph = graph.name(), %target, "unable to change graph state");
                Err(TransitionError::Failure {
                    name: graph.name().to_string(),
                    target,
                })
            }
            TransitionOutcome::Async => {
                tracing::debug!(graph = graph.name(), %target, "waiting for async state change");
                self.target = target;
                self.pending = Some(target);
                Ok(outcome)
            }
            TransitionOutcome::Success | TransitionOutcome::NoPreroll => {
                self.target = target;
                Ok(outcome)
            }
        }
    }

    /// Folds a bus event into the tracked state. Returns the change when the
    /// event was an authoritative top-level transition.
    pub fn apply(&mut self, event: &Event) -> Option<StateChange> {
        let Event::StateChanged {
            source,
            old,
            new,
            pending,
        } = event
        else {
            return None;
        };
        if source.id != self.graph {
            tracing::trace!(node = %source, %old, %new, "child state changed");
            return None;
        }

        tracing::info!("graph state changed: {old} -> {new}");
        self.current = *new;
        self.pending = *pending;
        Some(StateChange {
            old: *old,
            new: *new,
            pending: *pending,
        })
    }
}
