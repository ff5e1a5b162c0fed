//! Session loop: drives frames through extraction, matching and the event
//! log, one observation at a time.
//!
//! The loop is synchronous. Each frame is fully processed (and any accepted
//! event flushed to storage) before the next one is pulled, and every
//! termination check runs between frames, never inside one.

use crate::events::{EventLog, EventLogError, EventOutcome, DEFAULT_COOLDOWN};
use crate::extract::{AcquisitionError, ExtractError, FaceExtractor};
use crate::matcher::{EuclideanMatcher, MatchError, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::registry::RegistrySnapshot;
use crate::types::BoundingBox;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default time budget for continuous capture.
pub const DEFAULT_SESSION_BUDGET: Duration = Duration::from_secs(300);
/// Default throughput reporting cadence, in frames.
pub const DEFAULT_REPORT_EVERY: u64 = 30;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("registry holds no reference embeddings; register someone first")]
    NoReferenceData,
    #[error(transparent)]
    AcquisitionFailure(#[from] AcquisitionError),
    #[error(transparent)]
    StorageUnavailable(#[from] EventLogError),
}

/// Tunables for a matching session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identification threshold (`distance < threshold` is a match).
    pub match_threshold: f32,
    /// Minimum spacing between two logged sightings of one identity.
    pub cooldown: Duration,
    /// Stop once this much time has elapsed. `None` runs until the source ends.
    pub max_elapsed: Option<Duration>,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
    /// Report throughput every N frames. 0 disables reporting.
    pub report_every: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            max_elapsed: Some(DEFAULT_SESSION_BUDGET),
            max_frames: None,
            report_every: DEFAULT_REPORT_EVERY,
        }
    }
}

/// Time source for event timestamps and the session budget.
pub trait Clock {
    /// Wall-clock time stamped on sighting events.
    fn now(&self) -> DateTime<Utc>;
    /// Monotonic time since the clock was created.
    fn elapsed(&self) -> Duration;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Cooperative cancellation flag, checked between frames.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-face outcome within a frame.
#[derive(Debug, Clone)]
pub struct FaceReport {
    pub bbox: BoundingBox,
    pub result: Result<MatchResult, MatchError>,
    /// Event log outcome; `None` for unknown faces and failed matches.
    pub event: Option<EventOutcome>,
}

/// Everything that happened to one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// 1-based position of the frame in the session.
    pub sequence: u64,
    /// Wall-clock time stamped on every sighting in this frame.
    pub observed_at: DateTime<Utc>,
    /// Faces in detector order.
    pub faces: Vec<FaceReport>,
    /// Why extraction failed, when the frame was skipped.
    pub skipped: Option<ExtractError>,
    /// Frames per second, present on reporting frames.
    pub throughput: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    SourceExhausted,
    TimeBudget,
    FrameLimit,
    Cancelled,
}

/// Totals for a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub frames: u64,
    pub skipped_frames: u64,
    pub faces: u64,
    pub known: u64,
    pub unknown: u64,
    pub events_recorded: u64,
    pub events_suppressed: u64,
    pub elapsed_secs: f64,
    pub stop_reason: StopReason,
}

#[derive(Debug, Default)]
struct Tally {
    frames: u64,
    skipped_frames: u64,
    faces: u64,
    known: u64,
    unknown: u64,
    events_recorded: u64,
    events_suppressed: u64,
}

impl Tally {
    fn add(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.skipped_frames += u64::from(report.skipped.is_some());
        for face in &report.faces {
            self.faces += 1;
            match &face.result {
                Ok(result) if result.is_known() => self.known += 1,
                Ok(_) => self.unknown += 1,
                Err(_) => {}
            }
            match face.event {
                Some(outcome) if outcome.is_recorded() => self.events_recorded += 1,
                Some(_) => self.events_suppressed += 1,
                None => {}
            }
        }
    }

    fn finish(self, elapsed: Duration, stop_reason: StopReason) -> SessionSummary {
        SessionSummary {
            frames: self.frames,
            skipped_frames: self.skipped_frames,
            faces: self.faces,
            known: self.known,
            unknown: self.unknown,
            events_recorded: self.events_recorded,
            events_suppressed: self.events_suppressed,
            elapsed_secs: elapsed.as_secs_f64(),
            stop_reason,
        }
    }
}

/// A matching session over a read-only registry snapshot.
///
/// The session is the single writer of its event log for its whole lifetime.
pub struct Session<'a, E, C = SystemClock> {
    snapshot: &'a RegistrySnapshot,
    events: &'a mut EventLog,
    extractor: E,
    matcher: EuclideanMatcher,
    clock: C,
    config: SessionConfig,
    stop: StopFlag,
}

impl<'a, E: FaceExtractor> Session<'a, E, SystemClock> {
    /// Start a session. Fails fast when the registry is empty, since every
    /// match would be `NoReferenceData`.
    pub fn new(
        snapshot: &'a RegistrySnapshot,
        events: &'a mut EventLog,
        extractor: E,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        if snapshot.is_empty() {
            return Err(SessionError::NoReferenceData);
        }
        Ok(Self {
            snapshot,
            events,
            extractor,
            matcher: EuclideanMatcher,
            clock: SystemClock::new(),
            config,
            stop: StopFlag::new(),
        })
    }
}

impl<'a, E: FaceExtractor, C: Clock> Session<'a, E, C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Session<'a, E, C2> {
        Session {
            snapshot: self.snapshot,
            events: self.events,
            extractor: self.extractor,
            matcher: self.matcher,
            clock,
            config: self.config,
            stop: self.stop,
        }
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Process a single still image. No loop, no budget.
    pub fn run_single(&mut self, frame: &E::Frame) -> Result<FrameReport, SessionError> {
        self.process_frame(1, frame)
    }

    /// Drive `frames` until the source ends, the time or frame budget runs
    /// out, or the stop flag is raised. `on_frame` sees every frame report.
    ///
    /// An acquisition error ends the session with `AcquisitionFailure`;
    /// every event accepted before it is already on disk.
    pub fn run<I, F>(&mut self, frames: I, mut on_frame: F) -> Result<SessionSummary, SessionError>
    where
        I: IntoIterator<Item = Result<E::Frame, AcquisitionError>>,
        F: FnMut(&FrameReport),
    {
        let mut frames = frames.into_iter();
        let mut tally = Tally::default();
        let started = self.clock.elapsed();
        let elapsed = |clock: &C| clock.elapsed().saturating_sub(started);

        tracing::info!(
            references = self.snapshot.len(),
            threshold = self.config.match_threshold,
            cooldown_secs = self.config.cooldown.as_secs_f32(),
            max_elapsed_secs = ?self.config.max_elapsed.map(|d| d.as_secs_f32()),
            max_frames = ?self.config.max_frames,
            "session started"
        );

        let stop_reason = loop {
            if self.stop.is_stopped() {
                break StopReason::Cancelled;
            }
            if self.config.max_frames.is_some_and(|max| tally.frames >= max) {
                break StopReason::FrameLimit;
            }
            if self
                .config
                .max_elapsed
                .is_some_and(|budget| elapsed(&self.clock) >= budget)
            {
                break StopReason::TimeBudget;
            }

            let frame = match frames.next() {
                None => break StopReason::SourceExhausted,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::error!(error = %e, frames = tally.frames, "frame source failed; ending session");
                    return Err(e.into());
                }
            };

            let mut report = self.process_frame(tally.frames + 1, &frame)?;
            tally.add(&report);

            let every = self.config.report_every;
            if every > 0 && tally.frames % every == 0 {
                let secs = elapsed(&self.clock).as_secs_f32();
                if secs > 0.0 {
                    let fps = tally.frames as f32 / secs;
                    tracing::info!(frames = tally.frames, elapsed_secs = secs, fps, "session throughput");
                    report.throughput = Some(fps);
                }
            }

            on_frame(&report);
        };

        let summary = tally.finish(elapsed(&self.clock), stop_reason);
        tracing::info!(
            frames = summary.frames,
            faces = summary.faces,
            known = summary.known,
            unknown = summary.unknown,
            events = summary.events_recorded,
            reason = ?summary.stop_reason,
            "session finished"
        );
        Ok(summary)
    }

    fn process_frame(&mut self, sequence: u64, frame: &E::Frame) -> Result<FrameReport, SessionError> {
        let detections = self.extractor.extract(frame);
        let observed_at = self.clock.now();
        let detections = match detections {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(sequence, error = %e, "extraction failed; skipping frame");
                return Ok(FrameReport {
                    sequence,
                    observed_at,
                    faces: Vec::new(),
                    skipped: Some(e),
                    throughput: None,
                });
            }
        };

        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let result = self.matcher.compare(
                &detection.embedding,
                self.snapshot,
                self.config.match_threshold,
            );

            let event = match &result {
                Ok(m) => match m.identity() {
                    Some(identity) => {
                        let outcome =
                            self.events
                                .record_sighting(identity, observed_at, self.config.cooldown);
                        if outcome.is_recorded() {
                            // Flush before moving on; a crash may lose at most this event.
                            self.events.persist()?;
                            tracing::info!(identity = %identity, distance = m.distance, ?outcome, "sighting recorded");
                        }
                        Some(outcome)
                    }
                    None => None,
                },
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "face could not be matched");
                    None
                }
            };

            faces.push(FaceReport {
                bbox: detection.bbox,
                result,
                event,
            });
        }

        Ok(FrameReport {
            sequence,
            observed_at,
            faces,
            skipped: None,
            throughput: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchOutcome;
    use crate::registry::RegistryEntry;
    use crate::types::{Detection, Embedding, Identity};
    use chrono::TimeZone;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Test clock driven by the extractor: every extraction advances time.
    #[derive(Clone)]
    struct ManualClock {
        base: DateTime<Utc>,
        offset: Rc<Cell<Duration>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Utc.with_ymd_and_hms(2024, 11, 5, 14, 30, 0).unwrap(),
                offset: Rc::new(Cell::new(Duration::ZERO)),
            }
        }

        fn set(&self, offset: Duration) {
            self.offset.set(offset);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.offset.get()).unwrap()
        }

        fn elapsed(&self) -> Duration {
            self.offset.get()
        }
    }

    /// A frame is the capture time plus what the external extractor would
    /// have found in it; `None` faces simulate an extraction failure.
    struct TestFrame {
        at: Duration,
        faces: Option<Vec<Detection>>,
    }

    struct TestExtractor {
        clock: ManualClock,
    }

    impl FaceExtractor for TestExtractor {
        type Frame = TestFrame;

        fn extract(&mut self, frame: &TestFrame) -> Result<Vec<Detection>, ExtractError> {
            self.clock.set(frame.at);
            frame
                .faces
                .clone()
                .ok_or_else(|| ExtractError::Failed("corrupt frame".into()))
        }
    }

    fn entry(label: &str, values: &[f32]) -> RegistryEntry {
        RegistryEntry {
            identity: Identity::new(label).unwrap(),
            index: 1,
            embedding: Embedding::new(values.to_vec()),
            national_id: None,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    fn face(values: &[f32]) -> Detection {
        Detection {
            bbox: BoundingBox::from_edges(0.0, 10.0, 10.0, 0.0),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    fn frame(at_secs: u64, faces: Vec<Detection>) -> Result<TestFrame, AcquisitionError> {
        Ok(TestFrame {
            at: Duration::from_secs(at_secs),
            faces: Some(faces),
        })
    }

    fn log_in(dir: &tempfile::TempDir) -> EventLog {
        EventLog::new(dir.path().join("sightings.json"))
    }

    fn session<'a>(
        snapshot: &'a RegistrySnapshot,
        events: &'a mut EventLog,
        config: SessionConfig,
    ) -> Session<'a, TestExtractor, ManualClock> {
        let clock = ManualClock::new();
        Session::new(snapshot, events, TestExtractor { clock: clock.clone() }, config)
            .unwrap()
            .with_clock(clock)
    }

    fn unbounded() -> SessionConfig {
        SessionConfig {
            max_elapsed: None,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_empty_registry_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::default();
        let mut events = log_in(&dir);
        let extractor = TestExtractor {
            clock: ManualClock::new(),
        };
        assert!(matches!(
            Session::new(&snapshot, &mut events, extractor, SessionConfig::default()),
            Err(SessionError::NoReferenceData)
        ));
        assert!(events.is_empty());
        assert!(!dir.path().join("sightings.json").exists());
    }

    #[test]
    fn test_alice_cooldown_over_frames() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let query = [0.3, 0.0];

        let mut seen = Vec::new();
        let summary = session(&snapshot, &mut events, unbounded())
            .run(
                vec![frame(0, vec![face(&query)]), frame(30, vec![face(&query)]), frame(61, vec![face(&query)])],
                |report| seen.push(report.faces[0].event),
            )
            .unwrap();

        assert_eq!(
            seen,
            vec![
                Some(EventOutcome::FirstSighting),
                Some(EventOutcome::Suppressed),
                Some(EventOutcome::RepeatSighting),
            ]
        );
        assert_eq!(summary.stop_reason, StopReason::SourceExhausted);
        assert_eq!(summary.events_recorded, 2);
        assert_eq!(summary.events_suppressed, 1);

        // Every accepted event is already on disk.
        let (reloaded, _) = EventLog::open(dir.path().join("sightings.json"));
        assert_eq!(reloaded.sightings(&Identity::new("alice").unwrap()).len(), 2);
    }

    #[test]
    fn test_two_faces_keep_detection_order() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("bob", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let frame = TestFrame {
            at: Duration::ZERO,
            faces: Some(vec![face(&[0.2, 0.0]), face(&[0.9, 0.0])]),
        };

        let report = session(&snapshot, &mut events, SessionConfig::default())
            .run_single(&frame)
            .unwrap();

        assert_eq!(report.faces.len(), 2);
        let first = report.faces[0].result.as_ref().unwrap();
        assert_eq!(first.outcome, MatchOutcome::Known(Identity::new("bob").unwrap()));
        let second = report.faces[1].result.as_ref().unwrap();
        assert_eq!(second.outcome, MatchOutcome::Unknown);
        assert_eq!(report.faces[0].event, Some(EventOutcome::FirstSighting));
        assert_eq!(report.faces[1].event, None);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_time_budget_checked_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let config = SessionConfig {
            max_elapsed: Some(Duration::from_secs(10)),
            ..SessionConfig::default()
        };
        // The second frame is slow and overruns the budget on its own.
        let frames = (0..).map(|i| frame(if i == 0 { 1 } else { 15 + i }, Vec::new()));

        let summary = session(&snapshot, &mut events, config).run(frames, |_| {}).unwrap();
        assert_eq!(summary.stop_reason, StopReason::TimeBudget);
        assert_eq!(summary.frames, 2);
    }

    #[test]
    fn test_frame_limit() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let config = SessionConfig {
            max_frames: Some(3),
            ..unbounded()
        };
        let frames = std::iter::repeat_with(|| frame(0, Vec::new()));

        let summary = session(&snapshot, &mut events, config).run(frames, |_| {}).unwrap();
        assert_eq!(summary.stop_reason, StopReason::FrameLimit);
        assert_eq!(summary.frames, 3);
    }

    #[test]
    fn test_stop_flag_takes_effect_between_frames() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let mut session = session(&snapshot, &mut events, unbounded());
        let stop = session.stop_flag();

        let frames = (0..100).map(|i| frame(i, vec![face(&[0.0, 0.0])]));
        let summary = session
            .run(frames, |report| {
                // The frame that raised the flag still completes.
                assert!(!report.faces.is_empty());
                if report.sequence == 2 {
                    stop.stop();
                }
            })
            .unwrap();

        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.events_recorded, 1);
    }

    #[test]
    fn test_acquisition_failure_is_terminal_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let frames = vec![
            frame(0, vec![face(&[0.1, 0.0])]),
            Err(AcquisitionError::new("camera unplugged")),
            frame(100, vec![face(&[0.1, 0.0])]),
        ];

        let err = session(&snapshot, &mut events, unbounded())
            .run(frames, |_| {})
            .unwrap_err();
        assert!(matches!(err, SessionError::AcquisitionFailure(_)));

        let (reloaded, _) = EventLog::open(dir.path().join("sightings.json"));
        assert_eq!(reloaded.sightings(&Identity::new("alice").unwrap()).len(), 1);
    }

    #[test]
    fn test_extraction_failure_skips_frame() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let frames = vec![
            Ok(TestFrame {
                at: Duration::ZERO,
                faces: None,
            }),
            frame(1, vec![face(&[0.0, 0.0])]),
        ];

        let summary = session(&snapshot, &mut events, unbounded())
            .run(frames, |_| {})
            .unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.skipped_frames, 1);
        assert_eq!(summary.known, 1);
    }

    #[test]
    fn test_single_frame_skip_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let still = TestFrame {
            at: Duration::ZERO,
            faces: None,
        };

        let report = session(&snapshot, &mut events, unbounded())
            .run_single(&still)
            .unwrap();
        assert!(report.faces.is_empty());
        assert!(matches!(report.skipped, Some(ExtractError::Failed(ref reason)) if reason == "corrupt frame"));
    }

    #[test]
    fn test_dimension_mismatch_is_isolated_per_face() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let frame = TestFrame {
            at: Duration::ZERO,
            faces: Some(vec![face(&[0.0, 0.0, 0.0]), face(&[0.0, 0.0])]),
        };

        let report = session(&snapshot, &mut events, SessionConfig::default())
            .run_single(&frame)
            .unwrap();
        assert!(matches!(report.faces[0].result, Err(MatchError::DimensionMismatch { .. })));
        assert_eq!(report.faces[1].event, Some(EventOutcome::FirstSighting));
    }

    #[test]
    fn test_throughput_reported_on_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = log_in(&dir);
        let config = SessionConfig {
            report_every: 2,
            ..unbounded()
        };
        let frames = (1..=4).map(|i| frame(i, Vec::new()));

        let mut reported = Vec::new();
        session(&snapshot, &mut events, config)
            .run(frames, |report| reported.push(report.throughput))
            .unwrap();

        assert!(reported[0].is_none());
        assert!(reported[2].is_none());
        // 2 frames in 2s, then 4 frames in 4s.
        assert!((reported[1].unwrap() - 1.0).abs() < 1e-6);
        assert!((reported[3].unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_storage_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", &[0.0, 0.0])]);
        let mut events = EventLog::new(dir.path().join("missing/sightings.json"));

        let err = session(&snapshot, &mut events, unbounded())
            .run(vec![frame(0, vec![face(&[0.0, 0.0])])], |_| {})
            .unwrap_err();
        assert!(matches!(err, SessionError::StorageUnavailable(_)));
    }
}
