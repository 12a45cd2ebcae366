//! Control core for runtime-mutable media graphs.
//!
//! A graph of opaque processing nodes runs on worker threads it does not
//! share with the caller. This crate keeps one control thread in charge of
//! it: lifecycle requests, topology changes and position/seek bookkeeping
//! all happen there, while worker discoveries come back as events on a
//! shared bus. Concrete node kinds in [`elements`] are simulations that
//! exercise those paths without decoding any media.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod control;
pub mod cycle;
pub mod elements;
pub mod error;
pub mod graph;
pub mod node;
pub mod player;
pub mod resolver;
pub mod state;
pub mod timeline;

pub use bridge::{AppBridge, StreamCatalog, StreamInfo, StreamKind};
pub use bus::{BusSender, Event, EventBus, EventSource};
pub use config::{AppConfig, CycleConfig, PlaybackConfig, ResolverConfig};
pub use control::{Context, Controller, Flow, RunSummary, TimerAction, TimerId};
pub use cycle::SourceCycler;
pub use error::{MediaCtlError, Result};
pub use graph::{Graph, LinkHandle, NodeContext, PadAdded};
pub use node::{Caps, Node, ObjectId, PadId, PadSpec, PropertyValue, State, TransitionOutcome};
pub use player::{Player, PlayerView, SessionEnd};
pub use resolver::{LinkResolver, ResolveOutcome};
pub use state::{StateChange, StateMachine};
pub use timeline::{format_clock_time, PositionCoordinator, PositionSnapshot, SeekPolicy};
