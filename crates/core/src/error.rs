use crate::node::{ObjectId, PadId, State};

/// Result alias that carries the crate-wide [`MediaCtlError`] type.
pub type Result<T> = std::result::Result<T, MediaCtlError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MediaCtlError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Seek(#[from] SeekError),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed configuration or event payload.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

/// A required node could not be created. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConstructionError {
    #[error("no node factory for kind `{0}`")]
    UnknownKind(String),
    #[error("node `{name}` of kind `{kind}` could not be created: {reason}")]
    Failed {
        kind: String,
        name: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("a node named `{0}` already exists in the graph")]
    DuplicateNode(String),
    #[error("no node {0} in the graph")]
    UnknownNode(ObjectId),
    #[error("node `{name}` is linked and still {state}; quiesce it first")]
    NodeBusy { name: String, state: State },
    #[error("node `{name}` did not settle in NULL while quiescing")]
    QuiesceFailed { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("pads {src} and {sink} have incompatible types `{src_caps}` / `{sink_caps}`")]
    Incompatible {
        src: PadId,
        sink: PadId,
        src_caps: String,
        sink_caps: String,
    },
    /// The pad already has a different peer. Callers resolving pads at
    /// runtime treat this as a successful no-op.
    #[error("pad {pad} is already linked to {peer}")]
    AlreadyLinked { pad: PadId, peer: PadId },
    #[error("pad {0} does not exist or has not been announced yet")]
    PadUnresolved(PadId),
    #[error("pad {0} has the wrong direction for this end of a link")]
    WrongDirection(PadId),
    #[error("no free compatible pads between `{src}` and `{sink}`")]
    NoFreePads { src: String, sink: String },
}

impl LinkError {
    /// Returns `true` for outcomes that leave the graph exactly as the caller
    /// wanted it.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyLinked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("state change of `{name}` to {target} failed")]
    Failure { name: String, target: State },
}

/// Position and duration queries fail while the graph is still negotiating.
/// The poller retries on its next tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("position is not available yet")]
    PositionUnavailable,
    #[error("duration is not available yet")]
    DurationUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeekError {
    #[error("a seek is already in flight")]
    InProgress,
    #[error("the stream is not seekable")]
    NotSeekable,
    #[error("seek target {target_ms}ms lies outside the seekable range")]
    OutOfRange { target_ms: u128 },
    #[error("the graph rejected the seek")]
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    #[error("node `{node}` has no property `{name}`")]
    Unknown { node: String, name: String },
    #[error("property `{name}` on `{node}` expects a {expected} value")]
    WrongType {
        node: String,
        name: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("the event bus has been shut down")]
    Closed,
}
