//! Graph of nodes and links plus the aggregated top-level lifecycle.
//!
//! Topology (nodes, pads, links) sits behind one lock that every mutating
//! operation takes. Position queries go through a copy-on-write snapshot of
//! the node list instead, so they never contend with relinking.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
    time::Duration,
};

use crate::{
    bridge::AppBridge,
    bus::{BusSender, Event, EventSource},
    error::{GraphError, LinkError},
    node::{Caps, Node, ObjectId, PadDirection, PadId, PadSpec, State, TransitionOutcome},
    timeline::{MediaQuery, SeekCapability, SeekFlags},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Resolved,
    /// Waiting for caps on at least one end.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub id: LinkId,
    pub src: PadId,
    pub sink: PadId,
    pub status: LinkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHandle {
    Resolved(LinkId),
    Pending(LinkId),
}

impl LinkHandle {
    pub fn id(&self) -> LinkId {
        match self {
            LinkHandle::Resolved(id) | LinkHandle::Pending(id) => *id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, LinkHandle::Pending(_))
    }
}

/// Graph-side record of a pad. The peer is an address, the [`Link`] record
/// owns the relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pad {
    pub id: PadId,
    pub direction: PadDirection,
    pub caps: Option<Caps>,
    pub peer: Option<PadId>,
    /// Announced at runtime rather than at construction.
    pub dynamic: bool,
}

/// Out-of-band notification that a node grew a new pad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadAdded {
    pub node: ObjectId,
    pub node_name: String,
    pub pad: PadId,
    pub caps: Option<Caps>,
}

type PadAddedHandler = dyn Fn(&Graph, &PadAdded) + Send + Sync;

#[derive(Default)]
struct Topology {
    nodes: Vec<Arc<dyn Node>>,
    pads: BTreeMap<PadId, Pad>,
    links: BTreeMap<LinkId, Link>,
    next_link: u64,
}

impl Topology {
    fn position(&self, id: ObjectId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id() == id)
    }

    fn node_name(&self, id: ObjectId) -> String {
        self.position(id)
            .map(|index| self.nodes[index].name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    fn link_between(&self, src: &PadId, sink: &PadId) -> Option<&Link> {
        self.links
            .values()
            .find(|link| &link.src == src && &link.sink == sink)
    }

    fn link_on(&self, pad: &PadId) -> Option<LinkId> {
        self.links
            .values()
            .find(|link| &link.src == pad || &link.sink == pad)
            .map(|link| link.id)
    }

    fn link(&mut self, src: &PadId, sink: &PadId) -> Result<LinkHandle, LinkError> {
        let src_pad = self
            .pads
            .get(src)
            .ok_or_else(|| LinkError::PadUnresolved(src.clone()))?;
        let sink_pad = self
            .pads
            .get(sink)
            .ok_or_else(|| LinkError::PadUnresolved(sink.clone()))?;
        if src_pad.direction != PadDirection::Src {
            return Err(LinkError::WrongDirection(src.clone()));
        }
        if sink_pad.direction != PadDirection::Sink {
            return Err(LinkError::WrongDirection(sink.clone()));
        }

        if src_pad.peer.as_ref() == Some(sink) {
            if let Some(existing) = self.link_between(src, sink) {
                return Ok(match existing.status {
                    LinkStatus::Resolved => LinkHandle::Resolved(existing.id),
                    LinkStatus::Pending => LinkHandle::Pending(existing.id),
                });
            }
        }
        if let Some(peer) = &src_pad.peer {
            return Err(LinkError::AlreadyLinked {
                pad: src.clone(),
                peer: peer.clone(),
            });
        }
        if let Some(peer) = &sink_pad.peer {
            return Err(LinkError::AlreadyLinked {
                pad: sink.clone(),
                peer: peer.clone(),
            });
        }

        let status = match (&src_pad.caps, &sink_pad.caps) {
            (Some(src_caps), Some(sink_caps)) => {
                if !src_caps.is_compatible(sink_caps) {
                    return Err(LinkError::Incompatible {
                        src: src.clone(),
                        sink: sink.clone(),
                        src_caps: src_caps.to_string(),
                        sink_caps: sink_caps.to_string(),
                    });
                }
                LinkStatus::Resolved
            }
            _ => LinkStatus::Pending,
        };

        self.next_link += 1;
        let id = LinkId(self.next_link);
        self.links.insert(
            id,
            Link {
                id,
                src: src.clone(),
                sink: sink.clone(),
                status,
            },
        );
        if let Some(pad) = self.pads.get_mut(src) {
            pad.peer = Some(sink.clone());
        }
        if let Some(pad) = self.pads.get_mut(sink) {
            pad.peer = Some(src.clone());
        }

        Ok(match status {
            LinkStatus::Resolved => {
                tracing::debug!(%src, %sink, "linked");
                LinkHandle::Resolved(id)
            }
            LinkStatus::Pending => {
                tracing::debug!(%src, %sink, "link deferred until caps are known");
                LinkHandle::Pending(id)
            }
        })
    }

    fn unlink(&mut self, id: LinkId) -> Option<Link> {
        let link = self.links.remove(&id)?;
        for pad in [&link.src, &link.sink] {
            if let Some(pad) = self.pads.get_mut(pad) {
                pad.peer = None;
            }
        }
        Some(link)
    }

    fn unlink_node(&mut self, node: ObjectId) -> usize {
        let doomed: Vec<LinkId> = self
            .links
            .values()
            .filter(|link| link.src.node == node || link.sink.node == node)
            .map(|link| link.id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.unlink(id))
            .count()
    }

    fn is_linked(&self, node: ObjectId) -> bool {
        self.links
            .values()
            .any(|link| link.src.node == node || link.sink.node == node)
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    current: State,
    target: State,
    /// Nodes that answered `Async` and have not committed the target yet.
    awaiting: HashSet<ObjectId>,
    /// Commits that raced ahead of the request loop.
    settled: HashSet<ObjectId>,
    collecting: bool,
}

pub(crate) struct GraphInner {
    id: ObjectId,
    name: String,
    bus: BusSender,
    topology: Mutex<Topology>,
    lifecycle: Mutex<Lifecycle>,
    snapshot: RwLock<Arc<Vec<Arc<dyn Node>>>>,
    pad_added: Mutex<Vec<Arc<PadAddedHandler>>>,
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        let topology = self
            .topology
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for node in topology.nodes.drain(..) {
            node.detach();
        }
    }
}

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Top-level pipeline instance. Cloning yields another handle to the same
/// graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    pub fn new(name: impl Into<String>, bus: BusSender) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                id: ObjectId::next(),
                name: name.into(),
                bus,
                topology: Mutex::new(Topology::default()),
                lifecycle: Mutex::new(Lifecycle::default()),
                snapshot: RwLock::new(Arc::new(Vec::new())),
                pad_added: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn source(&self) -> EventSource {
        EventSource::new(self.inner.id, self.inner.name.clone())
    }

    /// Posts on the graph's bus on behalf of the graph itself.
    pub fn post(&self, event: Event) {
        if let Err(err) = self.inner.bus.post(event) {
            tracing::debug!(%err, graph = %self.name(), "dropping event");
        }
    }

    pub fn add_node(&self, node: Arc<dyn Node>) -> Result<ObjectId, GraphError> {
        let id = node.id();
        {
            let mut topology = lock(&self.inner.topology);
            if topology
                .nodes
                .iter()
                .any(|existing| existing.id() == id || existing.name() == node.name())
            {
                return Err(GraphError::DuplicateNode(node.name().to_string()));
            }
            for spec in node.static_pads() {
                let pad = PadId::new(id, spec.name);
                topology.pads.insert(
                    pad.clone(),
                    Pad {
                        id: pad,
                        direction: spec.direction,
                        caps: spec.caps,
                        peer: None,
                        dynamic: false,
                    },
                );
            }
            topology.nodes.push(node.clone());
            self.refresh_snapshot(&topology);
        }

        node.attach(NodeContext {
            node: id,
            name: node.name().to_string(),
            bus: self.inner.bus.clone(),
            graph: Arc::downgrade(&self.inner),
        });
        tracing::debug!(graph = %self.name(), node = node.name(), kind = node.kind(), "added node");
        Ok(id)
    }

    /// Removes a node and every link touching it. A linked node must be below
    /// PAUSED, see [`quiesce_node`](Self::quiesce_node).
    pub fn remove_node(&self, id: ObjectId) -> Result<Arc<dyn Node>, GraphError> {
        let node = {
            let mut topology = lock(&self.inner.topology);
            let index = topology
                .position(id)
                .ok_or(GraphError::UnknownNode(id))?;
            let state = topology.nodes[index].state();
            if topology.is_linked(id) && state >= State::Paused {
                return Err(GraphError::NodeBusy {
                    name: topology.nodes[index].name().to_string(),
                    state,
                });
            }
            topology.unlink_node(id);
            topology.pads.retain(|pad, _| pad.node != id);
            let node = topology.nodes.remove(index);
            self.refresh_snapshot(&topology);
            node
        };

        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.awaiting.remove(&id);
            lifecycle.settled.remove(&id);
        }
        node.detach();
        tracing::debug!(graph = %self.name(), node = node.name(), "removed node");
        Ok(node)
    }

    /// Drives a single node down to NULL so it can be removed safely.
    pub fn quiesce_node(&self, id: ObjectId) -> Result<(), GraphError> {
        let node = self.node(id).ok_or(GraphError::UnknownNode(id))?;
        node.request_state(State::Null);
        if node.state() != State::Null {
            return Err(GraphError::QuiesceFailed {
                name: node.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn node(&self, id: ObjectId) -> Option<Arc<dyn Node>> {
        self.nodes().into_iter().find(|node| node.id() == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.nodes().into_iter().find(|node| node.name() == name)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> Vec<Arc<dyn Node>> {
        self.snapshot().as_ref().clone()
    }

    pub fn pad(&self, pad: &PadId) -> Option<Pad> {
        lock(&self.inner.topology).pads.get(pad).cloned()
    }

    pub fn pads_of(&self, node: ObjectId) -> Vec<Pad> {
        lock(&self.inner.topology)
            .pads
            .values()
            .filter(|pad| pad.id.node == node)
            .cloned()
            .collect()
    }

    pub fn links(&self) -> Vec<Link> {
        lock(&self.inner.topology).links.values().cloned().collect()
    }

    pub fn link_count(&self, node: ObjectId) -> usize {
        lock(&self.inner.topology)
            .links
            .values()
            .filter(|link| link.src.node == node || link.sink.node == node)
            .count()
    }

    /// Links `src` to `sink`. Linking the same pair again returns the
    /// existing handle.
    pub fn link(&self, src: &PadId, sink: &PadId) -> Result<LinkHandle, LinkError> {
        lock(&self.inner.topology).link(src, sink)
    }

    /// Links the first free, compatible pad pair between two nodes.
    pub fn link_nodes(&self, src: ObjectId, sink: ObjectId) -> Result<LinkHandle, LinkError> {
        let mut topology = lock(&self.inner.topology);
        let free = |direction: PadDirection, node: ObjectId| {
            topology
                .pads
                .values()
                .filter(|pad| pad.id.node == node && pad.direction == direction && pad.peer.is_none())
                .cloned()
                .collect::<Vec<_>>()
        };
        let src_pads = free(PadDirection::Src, src);
        let sink_pads = free(PadDirection::Sink, sink);

        let pair = src_pads.iter().find_map(|src_pad| {
            sink_pads
                .iter()
                .find(|sink_pad| match (&src_pad.caps, &sink_pad.caps) {
                    (Some(a), Some(b)) => a.is_compatible(b),
                    _ => true,
                })
                .map(|sink_pad| (src_pad.id.clone(), sink_pad.id.clone()))
        });

        match pair {
            Some((src_pad, sink_pad)) => topology.link(&src_pad, &sink_pad),
            None => Err(LinkError::NoFreePads {
                src: topology.node_name(src),
                sink: topology.node_name(sink),
            }),
        }
    }

    /// Links each node to the next one.
    pub fn link_many(&self, chain: &[ObjectId]) -> Result<Vec<LinkHandle>, LinkError> {
        chain
            .windows(2)
            .map(|pair| self.link_nodes(pair[0], pair[1]))
            .collect()
    }

    /// Removes the link on `pad`, if any.
    pub fn unlink(&self, pad: &PadId) -> Option<Link> {
        let mut topology = lock(&self.inner.topology);
        let id = topology.link_on(pad)?;
        topology.unlink(id)
    }

    /// Removes every link touching `node` and returns how many were dropped.
    pub fn unlink_node(&self, node: ObjectId) -> usize {
        lock(&self.inner.topology).unlink_node(node)
    }

    /// Registers a callback for runtime pad announcements. Handlers run on
    /// the announcing node's thread and must not block.
    pub fn connect_pad_added<F>(&self, handler: F)
    where
        F: Fn(&Graph, &PadAdded) + Send + Sync + 'static,
    {
        lock(&self.inner.pad_added).push(Arc::new(handler));
    }

    /// Last state the whole graph committed.
    pub fn state(&self) -> State {
        lock(&self.inner.lifecycle).current
    }

    pub fn target_state(&self) -> State {
        lock(&self.inner.lifecycle).target
    }

    /// Asks every node, sinks first, to move to `target`. When all of them
    /// settle synchronously the graph commits at once; otherwise it answers
    /// `Async` and commits when the last straggler confirms.
    pub fn request_state(&self, target: State) -> TransitionOutcome {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.target = target;
            lifecycle.awaiting.clear();
            lifecycle.settled.clear();
            lifecycle.collecting = true;
        }

        let mut pending = Vec::new();
        let mut no_preroll = false;
        for node in self.nodes().iter().rev() {
            match node.request_state(target) {
                TransitionOutcome::Success => {}
                TransitionOutcome::NoPreroll => no_preroll = true,
                TransitionOutcome::Async => pending.push(node.id()),
                TransitionOutcome::Failure => {
                    tracing::warn!(graph = %self.name(), node = node.name(), %target, "node refused state change");
                    let mut lifecycle = lock(&self.inner.lifecycle);
                    lifecycle.collecting = false;
                    lifecycle.target = lifecycle.current;
                    return TransitionOutcome::Failure;
                }
            }
        }

        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.collecting = false;
        let settled = std::mem::take(&mut lifecycle.settled);
        lifecycle.awaiting = pending
            .into_iter()
            .filter(|id| !settled.contains(id))
            .collect();

        if lifecycle.awaiting.is_empty() {
            let old = lifecycle.current;
            lifecycle.current = target;
            drop(lifecycle);
            self.post_steps(old, target);
            if no_preroll {
                TransitionOutcome::NoPreroll
            } else {
                TransitionOutcome::Success
            }
        } else {
            tracing::debug!(graph = %self.name(), %target, waiting = lifecycle.awaiting.len(), "state change is async");
            TransitionOutcome::Async
        }
    }

    /// Brings a freshly added node to the graph's target state.
    pub fn sync_node_state(&self, id: ObjectId) -> TransitionOutcome {
        let target = self.target_state();
        match self.node(id) {
            Some(node) => node.request_state(target),
            None => TransitionOutcome::Failure,
        }
    }

    fn post_steps(&self, old: State, new: State) {
        for (from, to) in old.steps_to(new) {
            self.post(Event::StateChanged {
                source: self.source(),
                old: from,
                new: to,
                pending: (to != new).then_some(new),
            });
        }
    }

    fn commit(&self, node: ObjectId, new: State) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if new != lifecycle.target {
            return;
        }
        if lifecycle.collecting {
            lifecycle.settled.insert(node);
            return;
        }
        if lifecycle.awaiting.remove(&node) && lifecycle.awaiting.is_empty() {
            let old = lifecycle.current;
            let target = lifecycle.target;
            lifecycle.current = target;
            drop(lifecycle);
            tracing::debug!(graph = %self.name(), %target, "async state change completed");
            self.post_steps(old, target);
            self.post(Event::AsyncDone {
                source: self.source(),
            });
        }
    }

    fn pad_added(&self, node: ObjectId, spec: PadSpec) {
        let announcement = {
            let mut topology = lock(&self.inner.topology);
            let Some(index) = topology.position(node) else {
                return;
            };
            let node_name = topology.nodes[index].name().to_string();
            let pad = PadId::new(node, spec.name);
            let entry = topology.pads.entry(pad.clone()).or_insert_with(|| Pad {
                id: pad.clone(),
                direction: spec.direction,
                caps: None,
                peer: None,
                dynamic: true,
            });
            if spec.caps.is_some() {
                entry.caps = spec.caps.clone();
            }
            PadAdded {
                node,
                node_name,
                pad,
                caps: spec.caps,
            }
        };

        tracing::debug!(node = %announcement.node_name, pad = %announcement.pad, "pad added");
        let handlers: Vec<_> = lock(&self.inner.pad_added).clone();
        for handler in handlers {
            handler(self, &announcement);
        }
    }

    /// Records negotiated caps on `pad` and resolves a deferred link on it.
    fn negotiate(&self, pad: PadId, caps: Caps) {
        let mut topology = lock(&self.inner.topology);
        let Some(entry) = topology.pads.get_mut(&pad) else {
            return;
        };
        entry.caps = Some(caps);

        let Some(link_id) = topology.link_on(&pad) else {
            return;
        };
        let Some(link) = topology.links.get(&link_id).cloned() else {
            return;
        };
        if link.status == LinkStatus::Resolved {
            tracing::debug!(%pad, "link already resolved, ignoring caps update");
            return;
        }

        let src_caps = topology.pads.get(&link.src).and_then(|pad| pad.caps.clone());
        let sink_caps = topology.pads.get(&link.sink).and_then(|pad| pad.caps.clone());
        let (Some(src_caps), Some(sink_caps)) = (src_caps, sink_caps) else {
            return;
        };

        if src_caps.is_compatible(&sink_caps) {
            if let Some(link) = topology.links.get_mut(&link_id) {
                link.status = LinkStatus::Resolved;
            }
            tracing::info!(src = %link.src, sink = %link.sink, caps = %src_caps, "deferred link resolved");
        } else {
            topology.unlink(link_id);
            tracing::warn!(
                src = %link.src,
                sink = %link.sink,
                %src_caps,
                %sink_caps,
                "deferred link dropped, caps are incompatible"
            );
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn Node>>> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn refresh_snapshot(&self, topology: &Topology) {
        *self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(topology.nodes.clone());
    }
}

impl MediaQuery for Graph {
    fn query_position(&self) -> Option<Duration> {
        self.snapshot().iter().find_map(|node| node.query_position())
    }

    fn query_duration(&self) -> Option<Duration> {
        self.snapshot().iter().find_map(|node| node.query_duration())
    }

    fn query_seeking(&self) -> Option<SeekCapability> {
        self.snapshot().iter().find_map(|node| node.query_seeking())
    }

    fn seek(&self, target: Duration, flags: SeekFlags) -> bool {
        let mut accepted = false;
        for node in self.snapshot().iter() {
            accepted |= node.seek(target, flags);
        }
        accepted
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topology = lock(&self.inner.topology);
        f.debug_struct("Graph")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("nodes", &topology.nodes.len())
            .field("links", &topology.links.len())
            .finish()
    }
}

/// Back channel a node uses from any of its threads.
#[derive(Clone)]
pub struct NodeContext {
    node: ObjectId,
    name: String,
    bus: BusSender,
    graph: Weak<GraphInner>,
}

impl NodeContext {
    pub fn source(&self) -> EventSource {
        EventSource::new(self.node, self.name.clone())
    }

    pub fn post(&self, event: Event) {
        if let Err(err) = self.bus.post(event) {
            tracing::debug!(%err, node = %self.name, "dropping event");
        }
    }

    pub fn post_error(&self, message: impl Into<String>, debug_info: Option<String>) {
        self.post(Event::Error {
            source: self.source(),
            message: message.into(),
            debug_info,
        });
    }

    /// Bridge for handing worker discoveries to the control thread.
    pub fn bridge(&self) -> AppBridge {
        AppBridge::new(self.bus.clone(), self.source())
    }

    /// Announces a completed state change of this node. Also settles the
    /// graph's pending async change once every node has arrived.
    pub fn commit_state(&self, old: State, new: State, pending: Option<State>) {
        self.post(Event::StateChanged {
            source: self.source(),
            old,
            new,
            pending,
        });
        if let Some(graph) = self.graph() {
            graph.commit(self.node, new);
        }
    }

    /// Announces a runtime pad. Pad-added handlers run before this returns.
    pub fn add_pad(&self, spec: PadSpec) {
        if let Some(graph) = self.graph() {
            graph.pad_added(self.node, spec);
        }
    }

    pub fn negotiate(&self, pad: &str, caps: Caps) {
        if let Some(graph) = self.graph() {
            graph.negotiate(PadId::new(self.node, pad), caps);
        }
    }

    fn graph(&self) -> Option<Graph> {
        self.graph.upgrade().map(|inner| Graph { inner })
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        bus::EventBus,
        error::PropertyError,
        node::{PropertyValue, TransitionOutcome},
    };

    /// Minimal node whose transitions settle synchronously unless told to go
    /// async.
    #[derive(Debug)]
    pub(crate) struct StubNode {
        id: ObjectId,
        name: String,
        pads: Vec<PadSpec>,
        state: Mutex<State>,
        pub(crate) go_async: bool,
        pub(crate) refuse: bool,
        pub(crate) ctx: Mutex<Option<NodeContext>>,
    }

    impl StubNode {
        pub(crate) fn new(name: &str, pads: Vec<PadSpec>) -> Arc<Self> {
            Arc::new(Self::build(name, pads, false))
        }

        pub(crate) fn refusing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                refuse: true,
                ..Self::build(name, vec![], false)
            })
        }

        pub(crate) fn asynchronous(name: &str, pads: Vec<PadSpec>) -> Arc<Self> {
            Arc::new(Self::build(name, pads, true))
        }

        fn build(name: &str, pads: Vec<PadSpec>, go_async: bool) -> Self {
            Self {
                id: ObjectId::next(),
                name: name.to_string(),
                pads,
                state: Mutex::new(State::Null),
                go_async,
                refuse: false,
                ctx: Mutex::new(None),
            }
        }

        pub(crate) fn context(&self) -> NodeContext {
            lock(&self.ctx).clone().expect("node is attached")
        }

        pub(crate) fn finish_async(&self, target: State) {
            let old = std::mem::replace(&mut *lock(&self.state), target);
            self.context().commit_state(old, target, None);
        }
    }

    impl Node for StubNode {
        fn id(&self) -> ObjectId {
            self.id
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &str {
            "stub"
        }

        fn static_pads(&self) -> Vec<PadSpec> {
            self.pads.clone()
        }

        fn set_property(&self, name: &str, _value: PropertyValue) -> Result<(), PropertyError> {
            Err(PropertyError::Unknown {
                node: self.name.clone(),
                name: name.to_string(),
            })
        }

        fn property(&self, _name: &str) -> Option<PropertyValue> {
            None
        }

        fn attach(&self, ctx: NodeContext) {
            *lock(&self.ctx) = Some(ctx);
        }

        fn detach(&self) {
            *lock(&self.ctx) = None;
        }

        fn state(&self) -> State {
            *lock(&self.state)
        }

        fn request_state(&self, target: State) -> TransitionOutcome {
            if self.refuse && target > *lock(&self.state) {
                return TransitionOutcome::Failure;
            }
            if self.go_async && target > *lock(&self.state) {
                return TransitionOutcome::Async;
            }
            *lock(&self.state) = target;
            TransitionOutcome::Success
        }
    }

    pub(crate) fn src_pad(caps: Option<&str>) -> PadSpec {
        PadSpec::src("src", caps.map(Caps::new))
    }

    pub(crate) fn sink_pad(caps: Option<&str>) -> PadSpec {
        PadSpec::sink("sink", caps.map(Caps::new))
    }

    fn drain(bus: &mut EventBus) -> Vec<Event> {
        std::iter::from_fn(|| bus.try_pop().map(|delivered| delivered.event)).collect()
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        graph.add_node(StubNode::new("source", vec![])).unwrap();
        let err = graph.add_node(StubNode::new("source", vec![])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(name) if name == "source"));
    }

    #[test]
    fn relinking_the_same_pair_is_idempotent() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let src = graph
            .add_node(StubNode::new("source", vec![src_pad(Some("video/x-raw"))]))
            .unwrap();
        let sink = graph
            .add_node(StubNode::new("sink", vec![sink_pad(Some("video/x-raw"))]))
            .unwrap();

        let (src_pad, sink_pad) = (PadId::new(src, "src"), PadId::new(sink, "sink"));
        let first = graph.link(&src_pad, &sink_pad).unwrap();
        let second = graph.link(&src_pad, &sink_pad).unwrap();
        assert_eq!(first, second);
        assert_eq!(graph.links().len(), 1);
        assert_eq!(graph.pad(&src_pad).unwrap().peer, Some(sink_pad));
    }

    #[test]
    fn linking_to_a_different_peer_reports_already_linked() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let src = graph
            .add_node(StubNode::new("source", vec![src_pad(Some("audio/x-raw"))]))
            .unwrap();
        let a = graph
            .add_node(StubNode::new("a", vec![sink_pad(Some("audio/x-raw"))]))
            .unwrap();
        let b = graph
            .add_node(StubNode::new("b", vec![sink_pad(Some("audio/x-raw"))]))
            .unwrap();
        graph.link_nodes(src, a).unwrap();
        let err = graph
            .link(&PadId::new(src, "src"), &PadId::new(b, "sink"))
            .unwrap_err();
        assert!(err.is_benign());
    }

    #[test]
    fn incompatible_caps_are_refused() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let src = graph
            .add_node(StubNode::new("source", vec![src_pad(Some("video/x-raw"))]))
            .unwrap();
        let sink = graph
            .add_node(StubNode::new("sink", vec![sink_pad(Some("audio/x-raw"))]))
            .unwrap();
        let err = graph
            .link(&PadId::new(src, "src"), &PadId::new(sink, "sink"))
            .unwrap_err();
        assert!(matches!(err, LinkError::Incompatible { .. }));
        assert!(graph.links().is_empty());
        assert_eq!(graph.link_nodes(src, sink).unwrap_err(), LinkError::NoFreePads {
            src: "source".into(),
            sink: "sink".into(),
        });
    }

    #[test]
    fn unknown_caps_defer_the_link_until_negotiation() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let source = StubNode::new("source", vec![src_pad(None)]);
        let src = graph.add_node(source.clone()).unwrap();
        let sink = graph
            .add_node(StubNode::new("sink", vec![sink_pad(Some("audio/*"))]))
            .unwrap();

        let handle = graph.link_nodes(src, sink).unwrap();
        assert!(handle.is_pending());

        source.context().negotiate("src", Caps::new("audio/x-raw"));
        assert_eq!(graph.links()[0].status, LinkStatus::Resolved);

        // Already resolved: a later update is a no-op.
        source.context().negotiate("src", Caps::new("video/x-raw"));
        assert_eq!(graph.links().len(), 1);
        assert_eq!(graph.links()[0].status, LinkStatus::Resolved);
    }

    #[test]
    fn incompatible_negotiation_drops_the_deferred_link() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let source = StubNode::new("source", vec![src_pad(None)]);
        let src = graph.add_node(source.clone()).unwrap();
        let sink = graph
            .add_node(StubNode::new("sink", vec![sink_pad(Some("audio/x-raw"))]))
            .unwrap();
        graph.link_nodes(src, sink).unwrap();

        source.context().negotiate("src", Caps::new("text/x-subtitle"));
        assert!(graph.links().is_empty());
        assert_eq!(graph.pad(&PadId::new(sink, "sink")).unwrap().peer, None);
    }

    #[test]
    fn linked_running_nodes_cannot_be_removed_until_quiesced() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let src = graph
            .add_node(StubNode::new("source", vec![src_pad(Some("video/x-raw"))]))
            .unwrap();
        let sink = graph
            .add_node(StubNode::new("sink", vec![sink_pad(Some("video/x-raw"))]))
            .unwrap();
        graph.link_nodes(src, sink).unwrap();
        assert_eq!(graph.request_state(State::Playing), TransitionOutcome::Success);

        assert!(matches!(
            graph.remove_node(src),
            Err(GraphError::NodeBusy { .. })
        ));
        graph.quiesce_node(src).unwrap();
        let removed = graph.remove_node(src).unwrap();
        assert_eq!(removed.name(), "source");
        assert!(graph.links().is_empty());
        assert!(graph.pads_of(src).is_empty());
        assert_eq!(graph.nodes().len(), 1);
    }

    #[test]
    fn synchronous_changes_post_one_event_per_step() {
        let mut bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        graph.add_node(StubNode::new("sink", vec![])).unwrap();
        assert_eq!(graph.request_state(State::Playing), TransitionOutcome::Success);
        assert_eq!(graph.state(), State::Playing);

        let steps: Vec<_> = drain(&mut bus)
            .into_iter()
            .map(|event| match event {
                Event::StateChanged {
                    old, new, pending, ..
                } => (old, new, pending),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            steps,
            vec![
                (State::Null, State::Ready, Some(State::Playing)),
                (State::Ready, State::Paused, Some(State::Playing)),
                (State::Paused, State::Playing, None),
            ]
        );
    }

    #[test]
    fn async_change_commits_after_the_last_node_confirms() {
        let mut bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let slow = StubNode::asynchronous("decoder", vec![]);
        graph.add_node(slow.clone()).unwrap();
        graph.add_node(StubNode::new("sink", vec![])).unwrap();

        assert_eq!(graph.request_state(State::Paused), TransitionOutcome::Async);
        assert_eq!(graph.state(), State::Null);
        assert!(drain(&mut bus).is_empty());

        slow.finish_async(State::Paused);
        assert_eq!(graph.state(), State::Paused);
        let events = drain(&mut bus);
        let graph_steps = events
            .iter()
            .filter(|event| {
                matches!(event, Event::StateChanged { source, .. } if source.id == graph.id())
            })
            .count();
        assert_eq!(graph_steps, 2);
        assert!(matches!(events.last(), Some(Event::AsyncDone { .. })));
    }

    #[test]
    fn pad_added_handlers_see_the_new_pad() {
        let bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let source = StubNode::new("source", vec![]);
        let src = graph.add_node(source.clone()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        graph.connect_pad_added(move |graph, added| {
            assert!(graph.pad(&added.pad).is_some());
            lock(&sink).push(added.pad.clone());
        });

        source
            .context()
            .add_pad(PadSpec::src("audio_0", Some(Caps::new("audio/x-raw"))));
        assert_eq!(*lock(&seen), vec![PadId::new(src, "audio_0")]);
        assert!(graph.pad(&PadId::new(src, "audio_0")).unwrap().dynamic);
    }
}
