use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, SeekError};

/// Read-only view the coordinator needs from a running graph.
pub trait MediaQuery {
    fn query_position(&self) -> Option<Duration>;
    fn query_duration(&self) -> Option<Duration>;
    fn query_seeking(&self) -> Option<SeekCapability>;
    /// Issues a seek. Completion is confirmed later on the bus.
    fn seek(&self, target: Duration, flags: SeekFlags) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekCapability {
    pub seekable: bool,
    pub start: Duration,
    /// `None` when the end of the seekable range is unknown.
    pub end: Option<Duration>,
}

impl SeekCapability {
    pub fn unseekable() -> Self {
        Self::default()
    }

    pub fn range(&self) -> (Duration, Option<Duration>) {
        (self.start, self.end)
    }

    pub fn contains(&self, target: Duration) -> bool {
        target >= self.start && self.end.map_or(true, |end| target <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekFlags {
    /// Discard queued data so the new position shows up immediately.
    pub flush: bool,
    /// Snap to the nearest key unit.
    pub key_unit: bool,
}

impl SeekFlags {
    pub const FLUSH_KEY_UNIT: SeekFlags = SeekFlags {
        flush: true,
        key_unit: true,
    };
}

impl Default for SeekFlags {
    fn default() -> Self {
        Self::FLUSH_KEY_UNIT
    }
}

/// When the poller should seek on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekPolicy {
    pub enabled: bool,
    /// Position that has to be passed before the seek fires.
    pub threshold_ms: u64,
    pub target_ms: u64,
    /// Re-arm once playback is back at or below the threshold.
    pub repeat: bool,
    pub flags: SeekFlags,
}

impl SeekPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn target(&self) -> Duration {
        Duration::from_millis(self.target_ms)
    }
}

impl Default for SeekPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: 10_000,
            target_ms: 30_000,
            repeat: false,
            flags: SeekFlags::FLUSH_KEY_UNIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionSnapshot {
    pub position: Option<Duration>,
    pub duration: Option<Duration>,
    pub seekable: bool,
    pub seek_in_progress: bool,
}

/// Answers "where are we / how long is this" against a graph whose clock
/// keeps running on other threads, and keeps at most one seek in flight.
#[derive(Debug, Default)]
pub struct PositionCoordinator {
    duration: Option<Duration>,
    seeking: Option<SeekCapability>,
    seek_in_progress: bool,
    seeks_issued: u32,
    policy: SeekPolicy,
    armed: bool,
}

impl PositionCoordinator {
    pub fn new(policy: SeekPolicy) -> Self {
        Self {
            policy,
            armed: true,
            ..Self::default()
        }
    }

    pub fn query_position(&self, graph: &dyn MediaQuery) -> Result<Duration, QueryError> {
        graph
            .query_position()
            .ok_or(QueryError::PositionUnavailable)
    }

    /// Served from cache until [`invalidate_duration`](Self::invalidate_duration).
    pub fn query_duration(&mut self, graph: &dyn MediaQuery) -> Result<Duration, QueryError> {
        if let Some(duration) = self.duration {
            return Ok(duration);
        }
        let duration = graph
            .query_duration()
            .ok_or(QueryError::DurationUnavailable)?;
        self.duration = Some(duration);
        Ok(duration)
    }

    pub fn invalidate_duration(&mut self) {
        self.duration = None;
    }

    pub fn cached_duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Asks the graph once; seekability is assumed stable afterwards.
    pub fn query_seek_capability(&mut self, graph: &dyn MediaQuery) -> SeekCapability {
        if let Some(capability) = self.seeking {
            return capability;
        }
        let capability = graph
            .query_seeking()
            .unwrap_or_else(SeekCapability::unseekable);
        if capability.seekable {
            tracing::info!(
                start = %format_clock_time(Some(capability.start)),
                end = %format_clock_time(capability.end),
                "seeking is enabled"
            );
        } else {
            tracing::info!("seeking is disabled for this stream");
        }
        self.seeking = Some(capability);
        capability
    }

    pub fn seek_capability(&self) -> Option<SeekCapability> {
        self.seeking
    }

    pub fn seek_in_progress(&self) -> bool {
        self.seek_in_progress
    }

    pub fn seeks_issued(&self) -> u32 {
        self.seeks_issued
    }

    pub fn request_seek(
        &mut self,
        graph: &dyn MediaQuery,
        target: Duration,
        flags: SeekFlags,
    ) -> Result<(), SeekError> {
        if self.seek_in_progress {
            return Err(SeekError::InProgress);
        }
        let capability = self.seeking.unwrap_or_default();
        if !capability.seekable {
            return Err(SeekError::NotSeekable);
        }
        if !capability.contains(target) {
            return Err(SeekError::OutOfRange {
                target_ms: target.as_millis(),
            });
        }
        if !graph.seek(target, flags) {
            return Err(SeekError::Rejected);
        }
        self.seek_in_progress = true;
        self.seeks_issued += 1;
        Ok(())
    }

    /// The flushing node's async-done ends the seek.
    pub fn seek_completed(&mut self) {
        if self.seek_in_progress {
            tracing::debug!("seek completed");
        }
        self.seek_in_progress = false;
    }

    /// Samples position and (if unknown) duration. Failures are logged and
    /// left for the next tick.
    pub fn sample(&mut self, graph: &dyn MediaQuery) -> PositionSnapshot {
        let position = match self.query_position(graph) {
            Ok(position) => Some(position),
            Err(err) => {
                tracing::warn!(%err, "could not query current position");
                None
            }
        };
        if let Err(err) = self.query_duration(graph) {
            tracing::warn!(%err, "could not query current duration");
        }
        self.snapshot(position)
    }

    pub fn snapshot(&self, position: Option<Duration>) -> PositionSnapshot {
        PositionSnapshot {
            position,
            duration: self.duration,
            seekable: self.seeking.map_or(false, |capability| capability.seekable),
            seek_in_progress: self.seek_in_progress,
        }
    }

    /// Applies the configured [`SeekPolicy`] to a freshly sampled position.
    /// Returns `None` when no seek was attempted.
    pub fn apply_policy(
        &mut self,
        graph: &dyn MediaQuery,
        position: Duration,
    ) -> Option<Result<(), SeekError>> {
        if !self.policy.enabled {
            return None;
        }
        if !self.armed {
            if self.policy.repeat && position <= self.policy.threshold() {
                self.armed = true;
            }
            return None;
        }
        let seekable = self.seeking.map_or(false, |capability| capability.seekable);
        if !seekable || self.seek_in_progress || position <= self.policy.threshold() {
            return None;
        }

        tracing::info!(
            threshold = %format_clock_time(Some(self.policy.threshold())),
            "threshold reached, performing seek"
        );
        let flags = self.policy.flags;
        let result = self.request_seek(graph, self.policy.target(), flags);
        if result.is_ok() {
            self.armed = false;
        }
        Some(result)
    }

    /// Forgets everything learned about the current stream.
    pub fn reset(&mut self) {
        self.duration = None;
        self.seeking = None;
        self.seek_in_progress = false;
        self.seeks_issued = 0;
        self.armed = true;
    }
}

/// Formats as `H:MM:SS.nnnnnnnnn`; unknown times become `99:99:99.999999999`.
pub fn format_clock_time(time: Option<Duration>) -> String {
    match time {
        Some(time) => {
            let secs = time.as_secs();
            format!(
                "{}:{:02}:{:02}.{:09}",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60,
                time.subsec_nanos()
            )
        }
        None => "99:99:99.999999999".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    #[derive(Default)]
    struct FakeGraph {
        position: Cell<Option<Duration>>,
        duration: Cell<Option<Duration>>,
        duration_queries: Cell<u32>,
        seeking_queries: Cell<u32>,
        seekable: bool,
        seeks: RefCell<Vec<Duration>>,
    }

    impl MediaQuery for FakeGraph {
        fn query_position(&self) -> Option<Duration> {
            self.position.get()
        }

        fn query_duration(&self) -> Option<Duration> {
            self.duration_queries.set(self.duration_queries.get() + 1);
            self.duration.get()
        }

        fn query_seeking(&self) -> Option<SeekCapability> {
            self.seeking_queries.set(self.seeking_queries.get() + 1);
            Some(SeekCapability {
                seekable: self.seekable,
                start: Duration::ZERO,
                end: self.duration.get(),
            })
        }

        fn seek(&self, target: Duration, _flags: SeekFlags) -> bool {
            self.seeks.borrow_mut().push(target);
            true
        }
    }

    fn seekable_graph() -> FakeGraph {
        FakeGraph {
            duration: Cell::new(Some(Duration::from_secs(52))),
            seekable: true,
            ..Default::default()
        }
    }

    #[test]
    fn duration_is_cached_until_invalidated() {
        let graph = seekable_graph();
        let mut coordinator = PositionCoordinator::new(SeekPolicy::disabled());

        assert_eq!(coordinator.query_duration(&graph), Ok(Duration::from_secs(52)));
        graph.duration.set(Some(Duration::from_secs(60)));
        assert_eq!(coordinator.query_duration(&graph), Ok(Duration::from_secs(52)));
        assert_eq!(graph.duration_queries.get(), 1);

        coordinator.invalidate_duration();
        assert_eq!(coordinator.query_duration(&graph), Ok(Duration::from_secs(60)));
        assert_eq!(graph.duration_queries.get(), 2);
    }

    #[test]
    fn failed_queries_are_not_cached() {
        let graph = FakeGraph::default();
        let mut coordinator = PositionCoordinator::new(SeekPolicy::disabled());

        let snapshot = coordinator.sample(&graph);
        assert_eq!(snapshot.position, None);
        assert_eq!(snapshot.duration, None);

        graph.duration.set(Some(Duration::from_secs(3)));
        graph.position.set(Some(Duration::from_secs(1)));
        let snapshot = coordinator.sample(&graph);
        assert_eq!(snapshot.position, Some(Duration::from_secs(1)));
        assert_eq!(snapshot.duration, Some(Duration::from_secs(3)));
    }

    #[test]
    fn seek_capability_is_queried_once() {
        let graph = seekable_graph();
        let mut coordinator = PositionCoordinator::new(SeekPolicy::disabled());
        assert!(coordinator.query_seek_capability(&graph).seekable);
        assert!(coordinator.query_seek_capability(&graph).seekable);
        assert_eq!(graph.seeking_queries.get(), 1);
    }

    #[test]
    fn second_seek_is_rejected_while_first_is_in_flight() {
        let graph = seekable_graph();
        let mut coordinator = PositionCoordinator::new(SeekPolicy::disabled());
        coordinator.query_seek_capability(&graph);

        let flags = SeekFlags::FLUSH_KEY_UNIT;
        assert_eq!(coordinator.request_seek(&graph, Duration::from_secs(5), flags), Ok(()));
        assert_eq!(
            coordinator.request_seek(&graph, Duration::from_secs(6), flags),
            Err(SeekError::InProgress)
        );
        assert_eq!(graph.seeks.borrow().len(), 1);

        coordinator.seek_completed();
        assert_eq!(coordinator.request_seek(&graph, Duration::from_secs(6), flags), Ok(()));
        assert_eq!(coordinator.seeks_issued(), 2);
    }

    #[test]
    fn rejects_seeks_on_unseekable_streams_and_out_of_range_targets() {
        let graph = FakeGraph {
            duration: Cell::new(Some(Duration::from_secs(10))),
            ..Default::default()
        };
        let mut coordinator = PositionCoordinator::new(SeekPolicy::disabled());
        let flags = SeekFlags::default();
        assert_eq!(
            coordinator.request_seek(&graph, Duration::from_secs(1), flags),
            Err(SeekError::NotSeekable)
        );

        let graph = FakeGraph {
            duration: Cell::new(Some(Duration::from_secs(10))),
            seekable: true,
            ..Default::default()
        };
        let mut coordinator = PositionCoordinator::new(SeekPolicy::disabled());
        coordinator.query_seek_capability(&graph);
        assert!(matches!(
            coordinator.request_seek(&graph, Duration::from_secs(11), flags),
            Err(SeekError::OutOfRange { .. })
        ));
    }

    #[test]
    fn one_shot_policy_seeks_once_after_threshold() {
        let graph = seekable_graph();
        let mut coordinator = PositionCoordinator::new(SeekPolicy::default());
        coordinator.query_seek_capability(&graph);

        assert!(coordinator
            .apply_policy(&graph, Duration::from_secs(9))
            .is_none());
        assert_eq!(
            coordinator.apply_policy(&graph, Duration::from_millis(10_001)),
            Some(Ok(()))
        );
        coordinator.seek_completed();
        assert!(coordinator
            .apply_policy(&graph, Duration::from_secs(31))
            .is_none());
        assert!(coordinator
            .apply_policy(&graph, Duration::from_secs(2))
            .is_none());
        assert!(coordinator
            .apply_policy(&graph, Duration::from_secs(12))
            .is_none());
        assert_eq!(*graph.seeks.borrow(), vec![Duration::from_secs(30)]);
    }

    #[test]
    fn repeating_policy_rearms_below_threshold() {
        let graph = seekable_graph();
        let mut coordinator = PositionCoordinator::new(SeekPolicy {
            repeat: true,
            target_ms: 1_000,
            ..SeekPolicy::default()
        });
        coordinator.query_seek_capability(&graph);

        assert_eq!(
            coordinator.apply_policy(&graph, Duration::from_secs(11)),
            Some(Ok(()))
        );
        coordinator.seek_completed();
        assert!(coordinator
            .apply_policy(&graph, Duration::from_secs(1))
            .is_none());
        assert_eq!(
            coordinator.apply_policy(&graph, Duration::from_secs(11)),
            Some(Ok(()))
        );
        assert_eq!(coordinator.seeks_issued(), 2);
    }

    #[test]
    fn formats_clock_time() {
        assert_eq!(
            format_clock_time(Some(Duration::new(3_725, 5))),
            "1:02:05.000000005"
        );
        assert_eq!(format_clock_time(None), "99:99:99.999999999");
    }
}
