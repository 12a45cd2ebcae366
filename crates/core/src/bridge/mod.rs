//! Re-entry point for discoveries made on worker threads.
//!
//! Workers never touch control-thread aggregates directly. They wrap what they
//! found in an `Application` event and the dispatch loop applies it later,
//! on the one thread that owns the aggregate.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::{
    bus::{BusSender, Event, EventSource},
    Result,
};

/// Tag of the event carrying a fresh stream list.
pub const TAGS_CHANGED: &str = "tags-changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Text,
}

/// Metadata of one elementary stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub kind: StreamKind,
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

/// Worker-side poster of application events.
#[derive(Debug, Clone)]
pub struct AppBridge {
    sender: BusSender,
    source: EventSource,
}

impl AppBridge {
    pub fn new(sender: BusSender, source: EventSource) -> Self {
        Self { sender, source }
    }

    pub fn post(&self, tag: impl Into<String>, payload: serde_json::Value) -> Result<()> {
        self.sender.post(Event::Application {
            source: self.source.clone(),
            tag: tag.into(),
            payload,
        })?;
        Ok(())
    }

    pub fn post_serialized<T: Serialize>(&self, tag: impl Into<String>, payload: &T) -> Result<()> {
        self.post(tag, serde_json::to_value(payload)?)
    }

    pub fn tags_changed(&self, streams: &[StreamInfo]) -> Result<()> {
        self.post_serialized(TAGS_CHANGED, &streams)
    }
}

/// Control-thread aggregate of every known stream.
#[derive(Debug, Default)]
pub struct StreamCatalog {
    streams: Vec<StreamInfo>,
    revision: u64,
}

impl StreamCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a `tags-changed` event. Returns `Ok(true)` when the catalogue
    /// was rebuilt, `Ok(false)` for unrelated events.
    pub fn handle(&mut self, event: &Event) -> Result<bool> {
        let Event::Application { tag, payload, .. } = event else {
            return Ok(false);
        };
        if tag != TAGS_CHANGED {
            return Ok(false);
        }

        let mut streams: Vec<StreamInfo> = serde_json::from_value(payload.clone())?;
        streams.sort_by_key(|stream| (stream.kind, stream.index));
        self.streams = streams;
        self.revision += 1;
        Ok(true)
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn count(&self, kind: StreamKind) -> usize {
        self.streams
            .iter()
            .filter(|stream| stream.kind == kind)
            .count()
    }

    /// Bumped on every rebuild.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Human-readable stream list.
    pub fn describe(&self) -> String {
        let mut text = String::new();
        for stream in &self.streams {
            let unknown = || "unknown".to_string();
            // Writing into a String cannot fail.
            let _ = match stream.kind {
                StreamKind::Video => writeln!(
                    text,
                    "Video stream {}:\n    codec: {}",
                    stream.index,
                    stream.codec.clone().unwrap_or_else(unknown)
                ),
                StreamKind::Audio => writeln!(
                    text,
                    "Audio stream {}:\n    codec: {}\n    language: {}\n    bitrate: {}",
                    stream.index,
                    stream.codec.clone().unwrap_or_else(unknown),
                    stream.language.clone().unwrap_or_else(unknown),
                    stream.bitrate.unwrap_or(0)
                ),
                StreamKind::Text => writeln!(
                    text,
                    "Subtitle stream {}:\n    language: {}",
                    stream.index,
                    stream.language.clone().unwrap_or_else(unknown)
                ),
            };
        }
        text
    }
}
