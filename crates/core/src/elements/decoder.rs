use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{lock, NodeCore, StreamClock, URI_DECODER};
use crate::{
    bridge::{StreamInfo, StreamKind},
    bus::Event,
    error::PropertyError,
    graph::NodeContext,
    node::{Caps, Node, ObjectId, PadSpec, PropertyValue, State, TransitionOutcome},
    timeline::{SeekCapability, SeekFlags},
};

/// Length of the bundled trailer.
const DEFAULT_DURATION_MS: i64 = 52_209;
const DEFAULT_PREROLL_MS: i64 = 30;
const KEY_UNIT: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_millis(20);

#[derive(Debug)]
enum Command {
    Seek(Duration),
    Shutdown,
}

#[derive(Debug)]
struct Worker {
    commands: Sender<Command>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Playback {
    clock: StreamClock,
    target: State,
    prerolled: bool,
}

/// Source that discovers its streams on a worker thread.
///
/// Moving to PAUSED answers `Async`; the worker announces one pad per stream,
/// publishes the stream list through the application bridge and only then
/// commits. End-of-stream is posted from the worker once the clock passes
/// `duration-ms`.
#[derive(Debug)]
pub struct UriDecoder {
    core: Arc<NodeCore>,
    playback: Arc<Mutex<Playback>>,
    worker: Mutex<Option<Worker>>,
}

impl UriDecoder {
    pub fn new(name: &str) -> Self {
        Self {
            core: Arc::new(NodeCore::new(
                URI_DECODER,
                name,
                &[
                    ("uri", PropertyValue::Str(String::new())),
                    ("duration-ms", PropertyValue::Int(DEFAULT_DURATION_MS)),
                    ("preroll-ms", PropertyValue::Int(DEFAULT_PREROLL_MS)),
                    ("subtitles", PropertyValue::Bool(true)),
                ],
            )),
            playback: Arc::new(Mutex::new(Playback::default())),
            worker: Mutex::new(None),
        }
    }

    fn duration(&self) -> Duration {
        duration_of(&self.core)
    }

    fn go_up(&self, current: State, target: State) -> TransitionOutcome {
        if current == State::Null {
            let uri = self.core.string("uri");
            if !uri.contains("://") {
                if let Some(ctx) = self.core.ctx() {
                    ctx.post_error(
                        "Resource not found.",
                        Some(format!("{}: cannot open uri '{uri}'", self.core.name())),
                    );
                }
                return TransitionOutcome::Failure;
            }
            self.core
                .commit(State::Ready, (target != State::Ready).then_some(target));
            if target == State::Ready {
                return TransitionOutcome::Success;
            }
        }

        if !lock(&self.playback).prerolled {
            return if self.spawn_worker() {
                TransitionOutcome::Async
            } else {
                TransitionOutcome::Failure
            };
        }

        lock(&self.playback).clock.start();
        self.core.commit(State::Playing, None);
        TransitionOutcome::Success
    }

    fn go_down(&self, target: State) {
        for (_, next) in self.core.state().steps_to(target) {
            {
                let mut playback = lock(&self.playback);
                match next {
                    State::Paused => playback.clock.pause(),
                    State::Ready => {
                        playback.clock.reset();
                        playback.prerolled = false;
                    }
                    _ => {}
                }
            }
            self.core.commit(next, (next != target).then_some(target));
        }
    }

    fn spawn_worker(&self) -> bool {
        let mut slot = lock(&self.worker);
        if slot.is_some() {
            return true;
        }

        let (commands, inbox) = unbounded();
        let core = self.core.clone();
        let playback = self.playback.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", self.core.name()))
            .spawn(move || run_worker(core, playback, inbox));
        match spawned {
            Ok(handle) => {
                *slot = Some(Worker { commands, handle });
                true
            }
            Err(err) => {
                drop(slot);
                if let Some(ctx) = self.core.ctx() {
                    ctx.post_error("Could not start streaming thread.", Some(err.to_string()));
                }
                false
            }
        }
    }

    fn stop_worker(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        let _ = worker.commands.send(Command::Shutdown);
        // The graph can be dropped from the worker itself; never join it there.
        if worker.handle.thread().id() == thread::current().id() {
            return;
        }
        if worker.handle.join().is_err() {
            tracing::error!(node = self.core.name(), "decoder worker panicked");
        }
    }
}

impl Node for UriDecoder {
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
        Vec::new()
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
        self.stop_worker();
        self.core.detach();
    }

    fn state(&self) -> State {
        self.core.state()
    }

    fn request_state(&self, target: State) -> TransitionOutcome {
        lock(&self.playback).target = target;
        if target <= State::Ready {
            self.stop_worker();
        }

        let current = self.core.state();
        if target > current {
            self.go_up(current, target)
        } else {
            self.go_down(target);
            TransitionOutcome::Success
        }
    }

    fn query_position(&self) -> Option<Duration> {
        let playback = lock(&self.playback);
        playback
            .prerolled
            .then(|| playback.clock.position().min(self.duration()))
    }

    fn query_duration(&self) -> Option<Duration> {
        lock(&self.playback).prerolled.then(|| self.duration())
    }

    fn query_seeking(&self) -> Option<SeekCapability> {
        lock(&self.playback).prerolled.then(|| SeekCapability {
            seekable: true,
            start: Duration::ZERO,
            end: Some(self.duration()),
        })
    }

    fn seek(&self, target: Duration, flags: SeekFlags) -> bool {
        if !lock(&self.playback).prerolled || target > self.duration() {
            return false;
        }
        let target = if flags.key_unit {
            let units = target.as_millis() / KEY_UNIT.as_millis();
            KEY_UNIT * units as u32
        } else {
            target
        };
        tracing::debug!(node = self.core.name(), ?target, flush = flags.flush, "seek requested");
        lock(&self.worker)
            .as_ref()
            .map_or(false, |worker| worker.commands.send(Command::Seek(target)).is_ok())
    }
}

impl Drop for UriDecoder {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn duration_of(core: &NodeCore) -> Duration {
    Duration::from_millis(u64::try_from(core.int("duration-ms")).unwrap_or_default())
}

fn streams_of(core: &NodeCore) -> Vec<StreamInfo> {
    let mut streams = vec![
        StreamInfo {
            kind: StreamKind::Video,
            index: 0,
            codec: Some("On2 VP8".to_string()),
            language: None,
            bitrate: None,
        },
        StreamInfo {
            kind: StreamKind::Audio,
            index: 0,
            codec: Some("Vorbis".to_string()),
            language: Some("en".to_string()),
            bitrate: Some(80_000),
        },
    ];
    if core.bool("subtitles") {
        streams.push(StreamInfo {
            kind: StreamKind::Text,
            index: 0,
            codec: None,
            language: Some("en".to_string()),
            bitrate: None,
        });
    }
    streams
}

fn pad_for(stream: &StreamInfo) -> PadSpec {
    let (prefix, caps) = match stream.kind {
        StreamKind::Video => ("video", Caps::new("video/x-raw")),
        StreamKind::Audio => (
            "audio",
            Caps::new("audio/x-raw")
                .with_field("rate", 48_000)
                .with_field("channels", 2),
        ),
        StreamKind::Text => ("text", Caps::new("text/x-raw")),
    };
    PadSpec::src(format!("{prefix}_{}", stream.index), Some(caps))
}

fn run_worker(core: Arc<NodeCore>, playback: Arc<Mutex<Playback>>, inbox: Receiver<Command>) {
    let preroll = Duration::from_millis(u64::try_from(core.int("preroll-ms")).unwrap_or_default());
    match inbox.recv_timeout(preroll) {
        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
        Ok(Command::Seek(_)) | Err(RecvTimeoutError::Timeout) => {}
    }
    let Some(ctx) = core.ctx() else {
        return;
    };

    let streams = streams_of(&core);
    for stream in &streams {
        ctx.add_pad(pad_for(stream));
    }
    if let Err(err) = ctx.bridge().tags_changed(&streams) {
        tracing::warn!(%err, node = core.name(), "could not publish stream tags");
    }
    ctx.post(Event::DurationInvalidated {
        source: ctx.source(),
    });

    let target = {
        let mut playback = lock(&playback);
        playback.prerolled = true;
        playback.target
    };
    tracing::debug!(node = core.name(), streams = streams.len(), "prerolled");
    core.commit(State::Paused, (target == State::Playing).then_some(State::Playing));
    let resume = {
        let mut playback = lock(&playback);
        let resume = playback.target == State::Playing;
        if resume {
            playback.clock.start();
        }
        resume
    };
    if resume {
        core.commit(State::Playing, None);
    }

    let duration = duration_of(&core);
    let mut eos_posted = false;
    loop {
        match inbox.recv_timeout(TICK) {
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Command::Seek(target)) => {
                lock(&playback).clock.seek(target);
                eos_posted = false;
                tracing::debug!(node = core.name(), ?target, "flushed to new position");
                ctx.post(Event::AsyncDone {
                    source: ctx.source(),
                });
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let position = lock(&playback).clock.position();
        if !eos_posted && core.state() == State::Playing && position >= duration {
            tracing::debug!(node = core.name(), "end of stream reached");
            ctx.post(Event::EndOfStream {
                source: ctx.source(),
            });
            eos_posted = true;
        }
    }
    tracing::trace!(node = core.name(), "decoder worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::EventBus,
        graph::{tests::StubNode, Graph},
        node::PadId,
        resolver::LinkResolver,
    };

    fn collect_until(bus: &mut EventBus, mut done: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Some(delivered) = bus.pop_timeout(Duration::from_secs(2)) {
            let stop = done(&delivered.event);
            seen.push(delivered.event);
            if stop {
                break;
            }
        }
        seen
    }

    #[test]
    fn missing_uri_fails_with_an_error_event() {
        let mut bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        graph.add_node(Arc::new(UriDecoder::new("source"))).unwrap();

        assert_eq!(graph.request_state(State::Paused), TransitionOutcome::Failure);
        let event = bus.try_pop().unwrap().event;
        assert!(matches!(event, Event::Error { message, .. } if message == "Resource not found."));
    }

    #[test]
    fn preroll_announces_pads_then_commits_asynchronously() {
        let mut bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let decoder = Arc::new(UriDecoder::new("source"));
        decoder
            .set_property("uri", "file:///media/trailer.webm".into())
            .unwrap();
        let decoder_id = graph.add_node(decoder.clone()).unwrap();
        let convert = graph
            .add_node(StubNode::new(
                "convert",
                vec![PadSpec::sink("sink", Some(Caps::new("audio/x-raw")))],
            ))
            .unwrap();
        LinkResolver::new(PadId::new(convert, "sink"), ["audio/x-raw"]).install(&graph);

        assert_eq!(graph.request_state(State::Paused), TransitionOutcome::Async);
        let events = collect_until(&mut bus, |event| matches!(event, Event::AsyncDone { .. }));

        assert_eq!(graph.state(), State::Paused);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Application { tag, .. } if tag == "tags-changed")));
        assert_eq!(graph.pads_of(decoder_id).len(), 3);
        assert_eq!(
            graph.pad(&PadId::new(convert, "sink")).unwrap().peer,
            Some(PadId::new(decoder_id, "audio_0"))
        );
        assert_eq!(decoder.query_duration(), Some(Duration::from_millis(52_209)));
        assert_eq!(decoder.query_position(), Some(Duration::ZERO));

        graph.request_state(State::Null);
        assert_eq!(decoder.state(), State::Null);
        assert_eq!(decoder.query_duration(), None);
    }

    #[test]
    fn seeks_snap_to_key_units_and_reach_end_of_stream() {
        let mut bus = EventBus::new();
        let graph = Graph::new("test-pipeline", bus.sender());
        let decoder = Arc::new(UriDecoder::new("source"));
        decoder.set_property("uri", "file:///clip.webm".into()).unwrap();
        decoder.set_property("duration-ms", 2_500_i64.into()).unwrap();
        graph.add_node(decoder.clone()).unwrap();

        graph.request_state(State::Playing);
        collect_until(&mut bus, |event| matches!(event, Event::AsyncDone { .. }));
        assert_eq!(decoder.state(), State::Playing);

        assert!(!decoder.seek(Duration::from_secs(60), SeekFlags::FLUSH_KEY_UNIT));
        assert!(decoder.seek(Duration::from_millis(2_100), SeekFlags::FLUSH_KEY_UNIT));
        let events = collect_until(&mut bus, |event| matches!(event, Event::EndOfStream { .. }));
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::AsyncDone { source } if source.id == decoder.id())));
        assert!(matches!(events.last(), Some(Event::EndOfStream { .. })));
    }
}
