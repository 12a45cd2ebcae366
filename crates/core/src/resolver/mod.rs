//! Late binding of pads that only appear once data starts flowing.
//!
//! A demuxing source announces one pad per elementary stream. The resolver
//! links the first one whose media type matches an accepted prefix to its
//! candidate sink pad and leaves every other branch unlinked.

use crate::{
    error::LinkError,
    graph::{Graph, LinkHandle, PadAdded},
    node::{Caps, PadDirection, PadId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Linked(LinkHandle),
    /// The candidate sink already has a peer; nothing to do.
    AlreadyLinked,
    /// The pad carries a type nobody asked for.
    Ignored { media_type: String },
    Failed(LinkError),
}

impl ResolveOutcome {
    /// Everything except a failed link leaves the graph valid.
    pub fn is_success(&self) -> bool {
        !matches!(self, ResolveOutcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct LinkResolver {
    sink: PadId,
    accepted: Vec<String>,
}

impl LinkResolver {
    pub fn new<I, S>(sink: PadId, accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sink,
            accepted: accepted.into_iter().map(Into::into).collect(),
        }
    }

    pub fn sink(&self) -> &PadId {
        &self.sink
    }

    pub fn accepts(&self, caps: &Caps) -> bool {
        self.accepted
            .iter()
            .any(|prefix| caps.starts_with(prefix))
    }

    /// Handles one pad announcement. Runs on the announcing node's thread,
    /// touches only link and pad state, and never blocks on the control
    /// thread.
    pub fn resolve(&self, graph: &Graph, added: &PadAdded) -> ResolveOutcome {
        let sink = match graph.pad(&self.sink) {
            Some(sink) => sink,
            None => return ResolveOutcome::Failed(LinkError::PadUnresolved(self.sink.clone())),
        };
        if sink.peer.is_some() {
            tracing::info!(pad = %added.pad, "we are already linked, ignoring");
            return ResolveOutcome::AlreadyLinked;
        }

        let new_pad = match graph.pad(&added.pad) {
            Some(pad) => pad,
            None => return ResolveOutcome::Failed(LinkError::PadUnresolved(added.pad.clone())),
        };
        let Some(caps) = added.caps.clone().or(new_pad.caps) else {
            tracing::info!(pad = %added.pad, "pad has no negotiated type yet, ignoring");
            return ResolveOutcome::Ignored {
                media_type: "unknown".to_string(),
            };
        };
        tracing::info!(
            "received new pad '{}' from '{}' with type '{}'",
            added.pad.name,
            added.node_name,
            caps.media_type()
        );

        if new_pad.direction != PadDirection::Src || !self.accepts(&caps) {
            tracing::info!(
                media_type = caps.media_type(),
                "pad type is not accepted, ignoring"
            );
            return ResolveOutcome::Ignored {
                media_type: caps.media_type().to_string(),
            };
        }

        match graph.link(&added.pad, &self.sink) {
            Ok(handle) => {
                tracing::info!(media_type = caps.media_type(), "link succeeded");
                ResolveOutcome::Linked(handle)
            }
            Err(err) if err.is_benign() => ResolveOutcome::AlreadyLinked,
            Err(err) => {
                tracing::error!(media_type = caps.media_type(), %err, "type is accepted but link failed");
                ResolveOutcome::Failed(err)
            }
        }
    }

    /// Registers the resolver on the graph's pad-added notifications.
    pub fn install(self, graph: &Graph) {
        graph.connect_pad_added(move |graph, added| {
            self.resolve(graph, added);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::EventBus,
        graph::tests::{sink_pad, StubNode},
        node::{Caps, Node, PadSpec},
    };

    struct Fixture {
        _bus: EventBus,
        graph: Graph,
        demux: std::sync::Arc<StubNode>,
        resolver: LinkResolver,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let demux = StubNode::new("source", vec![]);
        graph.add_node(demux.clone()).unwrap();
        let convert = graph
            .add_node(StubNode::new("convert", vec![sink_pad(Some("audio/x-raw"))]))
            .unwrap();
        let resolver = LinkResolver::new(PadId::new(convert, "sink"), ["audio/x-raw"]);
        Fixture {
            _bus: bus,
            graph,
            demux,
            resolver,
        }
    }

    fn announce(fixture: &Fixture, name: &str, media_type: &str) -> PadAdded {
        fixture
            .demux
            .context()
            .add_pad(PadSpec::src(name, Some(Caps::new(media_type))));
        PadAdded {
            node: fixture.demux.id(),
            node_name: "source".into(),
            pad: PadId::new(fixture.demux.id(), name),
            caps: Some(Caps::new(media_type)),
        }
    }

    #[test]
    fn links_accepted_pads() {
        let fixture = fixture();
        let added = announce(&fixture, "audio_0", "audio/x-raw");
        let outcome = fixture.resolver.resolve(&fixture.graph, &added);
        assert!(matches!(outcome, ResolveOutcome::Linked(LinkHandle::Resolved(_))));
        assert_eq!(
            fixture.graph.pad(fixture.resolver.sink()).unwrap().peer,
            Some(added.pad)
        );
    }

    #[test]
    fn leaves_unwanted_pads_unlinked() {
        let fixture = fixture();
        let added = announce(&fixture, "text_0", "text/x-subtitle");
        let outcome = fixture.resolver.resolve(&fixture.graph, &added);
        assert_eq!(
            outcome,
            ResolveOutcome::Ignored {
                media_type: "text/x-subtitle".into()
            }
        );
        assert!(outcome.is_success());
        assert!(fixture.graph.links().is_empty());
        assert_eq!(fixture.graph.pad(fixture.resolver.sink()).unwrap().peer, None);
    }

    #[test]
    fn second_match_is_a_no_op() {
        let fixture = fixture();
        let first = announce(&fixture, "audio_0", "audio/x-raw");
        fixture.resolver.resolve(&fixture.graph, &first);
        let second = announce(&fixture, "audio_1", "audio/x-raw");
        assert_eq!(
            fixture.resolver.resolve(&fixture.graph, &second),
            ResolveOutcome::AlreadyLinked
        );
        assert_eq!(fixture.graph.links().len(), 1);
    }

    #[test]
    fn installed_resolver_runs_on_announcement() {
        let fixture = fixture();
        fixture.resolver.clone().install(&fixture.graph);
        announce(&fixture, "video_0", "video/x-raw");
        assert!(fixture.graph.links().is_empty());
        announce(&fixture, "audio_0", "audio/x-raw");
        assert_eq!(fixture.graph.links().len(), 1);
    }
}
