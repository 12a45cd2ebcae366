//! Node capability surface shared by every processing element.
//!
//! The controller never looks inside a node. It only sees what is declared
//! here: identity, pads, properties, lifecycle transitions and the handful of
//! queries the position coordinator needs.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::PropertyError,
    graph::NodeContext,
    timeline::{SeekCapability, SeekFlags},
};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a graph or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle states, ordered `Null < Ready < Paused < Playing`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Null,
    Ready,
    Paused,
    Playing,
}

impl State {
    const ORDER: [State; 4] = [State::Null, State::Ready, State::Paused, State::Playing];

    fn rank(self) -> usize {
        self as usize
    }

    /// The adjacent state one step from `self` toward `target`.
    pub fn step_toward(self, target: State) -> State {
        match self.rank().cmp(&target.rank()) {
            std::cmp::Ordering::Less => Self::ORDER[self.rank() + 1],
            std::cmp::Ordering::Greater => Self::ORDER[self.rank() - 1],
            std::cmp::Ordering::Equal => self,
        }
    }

    /// Every adjacent `(from, to)` pair walked when moving from `self` to
    /// `target`, in order.
    pub fn steps_to(self, target: State) -> Vec<(State, State)> {
        let mut steps = Vec::new();
        let mut current = self;
        while current != target {
            let next = current.step_toward(target);
            steps.push((current, next));
            current = next;
        }
        steps
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nick = match self {
            State::Null => "null",
            State::Ready => "ready",
            State::Paused => "paused",
            State::Playing => "playing",
        };
        f.write_str(nick)
    }
}

/// Immediate answer to a state-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Success,
    /// Accepted; completion is confirmed later by a `StateChanged` event.
    Async,
    /// Succeeded, but the node cannot produce data in PAUSED (live sources).
    NoPreroll,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    Src,
    Sink,
}

/// Structured media-type descriptor such as `audio/x-raw, rate=48000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    media_type: String,
    #[serde(default)]
    fields: Vec<(String, String)>,
}

impl Caps {
    pub const ANY: &'static str = "ANY";

    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: Vec::new(),
        }
    }

    /// Descriptor that accepts every other descriptor.
    pub fn any() -> Self {
        Self::new(Self::ANY)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_any(&self) -> bool {
        self.media_type == Self::ANY
    }

    /// `audio` for `audio/x-raw`.
    pub fn family(&self) -> &str {
        self.media_type
            .split_once('/')
            .map(|(family, _)| family)
            .unwrap_or(&self.media_type)
    }

    /// `x-raw` for `audio/x-raw`, `*` when no subtype is given.
    pub fn subtype(&self) -> &str {
        self.media_type
            .split_once('/')
            .map(|(_, subtype)| subtype)
            .unwrap_or("*")
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.media_type.starts_with(prefix)
    }

    /// Families must agree; subtypes must agree unless either side is `*`.
    /// Fields present on both sides must carry the same value.
    pub fn is_compatible(&self, other: &Caps) -> bool {
        if self.is_any() || other.is_any() {
            return true;
        }
        if self.family() != other.family() {
            return false;
        }
        let subtype_ok =
            self.subtype() == "*" || other.subtype() == "*" || self.subtype() == other.subtype();
        subtype_ok
            && self
                .fields
                .iter()
                .all(|(key, value)| other.field(key).map_or(true, |v| v == value))
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        for (key, value) in &self.fields {
            write!(f, ", {key}={value}")?;
        }
        Ok(())
    }
}

/// Graph-wide pad address: owning node plus pad name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PadId {
    pub node: ObjectId,
    pub name: String,
}

impl PadId {
    pub fn new(node: ObjectId, name: impl Into<String>) -> Self {
        Self {
            node,
            name: name.into(),
        }
    }
}

impl fmt::Display for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

/// Pad announced by a node, either up front or at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadSpec {
    pub name: String,
    pub direction: PadDirection,
    /// `None` until the first data has been negotiated.
    pub caps: Option<Caps>,
}

impl PadSpec {
    pub fn src(name: impl Into<String>, caps: Option<Caps>) -> Self {
        Self {
            name: name.into(),
            direction: PadDirection::Src,
            caps,
        }
    }

    pub fn sink(name: impl Into<String>, caps: Option<Caps>) -> Self {
        Self {
            name: name.into(),
            direction: PadDirection::Sink,
            caps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Str(_) => "string",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(value) => write!(f, "{value}"),
            PropertyValue::Int(value) => write!(f, "{value}"),
            PropertyValue::Str(value) => f.write_str(value),
        }
    }
}

/// Capability set of an opaque processing element.
///
/// Nodes may run their own worker threads. Everything they discover at
/// runtime flows back through the [`NodeContext`] handed to [`Node::attach`]:
/// pads are announced synchronously, everything else is posted on the bus.
pub trait Node: Send + Sync + fmt::Debug {
    fn id(&self) -> ObjectId;
    fn name(&self) -> &str;
    fn kind(&self) -> &str;

    /// Pads that exist from construction.
    fn static_pads(&self) -> Vec<PadSpec>;

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<(), PropertyError>;
    fn property(&self, name: &str) -> Option<PropertyValue>;

    /// Called when the node joins a graph.
    fn attach(&self, ctx: NodeContext);
    /// Called when the node leaves its graph.
    fn detach(&self);

    fn state(&self) -> State;
    fn request_state(&self, target: State) -> TransitionOutcome;

    fn query_position(&self) -> Option<Duration> {
        None
    }

    fn query_duration(&self) -> Option<Duration> {
        None
    }

    fn query_seeking(&self) -> Option<SeekCapability> {
        None
    }

    fn seek(&self, _target: Duration, _flags: SeekFlags) -> bool {
        false
    }
}
