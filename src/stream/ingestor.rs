//! The event stream ingestor.
//!
//! A [`StreamIngestor`] owns at most one push connection, scoped to a set of
//! subject ids. Each `connect` spawns a session task that reads frames, keeps
//! per-subject pending buffers, throttles flushes into the published
//! [`StreamSnapshot`] and reconnects on transport errors.
//!
//! Every session is tagged with a generation number. `connect`, `disconnect`
//! and `Drop` bump the generation under the snapshot lock, and sessions only
//! mutate the snapshot while their generation is still current, so nothing a
//! cancelled session does afterwards (late frames, timers, reconnect results)
//! can leak into the published state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fixwatch_common::{
    Activity, ActivityKind, ActivityStatus, EventBody, ExecutionMetrics, StreamEvent,
    decode_frame, subject_hint,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::log::{DEFAULT_MAX_ACTIVITIES, PendingBuffer, merge_activities};
use super::throttle::{FlushDecision, FlushGate};
use super::transport::{FrameSource, PushTransport, SseTransport};
use crate::errors::TransportError;

pub const DEFAULT_THROTTLE_RATE: u32 = 10;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);
/// Rates above 1000/s collapse to this floor.
const MIN_FLUSH_INTERVAL_MICROS: u64 = 1_000;

/// Tuning knobs for a [`StreamIngestor`].
#[derive(Debug, Clone, PartialEq)]
pub struct IngestorConfig {
    /// Maximum flushes per second. Zero is treated as one.
    pub throttle_rate: u32,
    /// Activities retained per subject.
    pub max_activities: usize,
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            throttle_rate: DEFAULT_THROTTLE_RATE,
            max_activities: DEFAULT_MAX_ACTIVITIES,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl IngestorConfig {
    /// `1000 / throttle_rate` milliseconds, never below 1ms.
    pub fn min_flush_interval(&self) -> Duration {
        let micros = 1_000_000 / u64::from(self.throttle_rate.max(1));
        Duration::from_micros(micros.max(MIN_FLUSH_INTERVAL_MICROS))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the ingestor publishes, as one value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    pub connection_state: ConnectionState,
    /// Flushed, deduplicated activity log per subject.
    pub activities: HashMap<String, Vec<Activity>>,
    /// Latest metrics per subject.
    pub metrics: HashMap<String, ExecutionMetrics>,
    pub completed_subjects: HashSet<String>,
    /// Failure message per subject that reported an error event.
    pub failed_subjects: HashMap<String, String>,
    pub error: Option<String>,
    /// Number of flushes applied so far.
    pub flushes: u64,
}

impl StreamSnapshot {
    /// Whether a subject has reached a terminal outcome.
    pub fn is_settled(&self, subject_id: &str) -> bool {
        self.completed_subjects.contains(subject_id) || self.failed_subjects.contains_key(subject_id)
    }

    pub fn all_settled(&self, subject_ids: &[String]) -> bool {
        !subject_ids.is_empty() && subject_ids.iter().all(|id| self.is_settled(id))
    }
}

struct Shared {
    tx: watch::Sender<StreamSnapshot>,
    generation: AtomicU64,
    clear_epoch: AtomicU64,
}

impl Shared {
    /// Apply `f` if `generation` is still live. `f` returns whether it changed
    /// anything.
    fn update_with(&self, generation: u64, f: impl FnOnce(&mut StreamSnapshot) -> bool) -> bool {
        self.tx.send_if_modified(|snapshot| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            f(snapshot)
        })
    }

    fn update(&self, generation: u64, f: impl FnOnce(&mut StreamSnapshot)) -> bool {
        self.update_with(generation, |snapshot| {
            f(snapshot);
            true
        })
    }

    /// Invalidate the running session, if any, and return the new generation.
    fn bump_generation(&self, f: impl FnOnce(&mut StreamSnapshot) -> bool) -> u64 {
        let mut generation = 0;
        self.tx.send_if_modified(|snapshot| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            f(snapshot)
        });
        generation
    }
}

struct SessionHandle {
    subject_ids: Vec<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Consumes a server-push event stream for a set of subjects.
///
/// `connect` must be called from within a tokio runtime.
pub struct StreamIngestor {
    config: IngestorConfig,
    transport: Arc<dyn PushTransport>,
    shared: Arc<Shared>,
    session: Mutex<Option<SessionHandle>>,
}

impl StreamIngestor {
    pub fn new<T: PushTransport>(transport: T, config: IngestorConfig) -> Self {
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(transport: Arc<dyn PushTransport>, config: IngestorConfig) -> Self {
        let (tx, _rx) = watch::channel(StreamSnapshot::default());
        Self {
            config,
            transport,
            shared: Arc::new(Shared {
                tx,
                generation: AtomicU64::new(0),
                clear_epoch: AtomicU64::new(0),
            }),
            session: Mutex::new(None),
        }
    }

    /// Ingestor reading Server-Sent Events from `{base_url}/api/process/stream`.
    pub fn sse(base_url: impl Into<String>, config: IngestorConfig) -> Self {
        Self::new(SseTransport::new(base_url), config)
    }

    pub fn config(&self) -> &IngestorConfig {
        &self.config
    }

    /// Open one connection for all `subject_ids`, replacing any existing one.
    /// Does nothing when `subject_ids` is empty.
    pub fn connect<S: AsRef<str>>(&self, subject_ids: &[S]) {
        let subject_ids: Vec<String> = subject_ids.iter().map(|s| s.as_ref().to_string()).collect();
        if subject_ids.is_empty() {
            debug!("connect called without subjects; ignoring");
            return;
        }

        let mut session = self.lock_session();
        let generation = self.shared.bump_generation(|snapshot| {
            snapshot.connection_state = ConnectionState::Connecting;
            snapshot.error = None;
            true
        });
        if let Some(previous) = session.take() {
            previous.stop();
        }

        info!(subjects = ?subject_ids, generation, "connecting to event stream");

        let cancel = CancellationToken::new();
        let worker = Session {
            shared: Arc::clone(&self.shared),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            subject_ids: subject_ids.clone(),
            generation,
            cancel: cancel.clone(),
            pending: PendingBuffer::default(),
            gate: FlushGate::new(self.config.min_flush_interval()),
            epoch: self.shared.clear_epoch.load(Ordering::SeqCst),
        };
        let task = tokio::spawn(worker.run());

        *session = Some(SessionHandle {
            subject_ids,
            cancel,
            task,
        });
    }

    /// Close the connection and cancel every timer. Idempotent.
    pub fn disconnect(&self) {
        let mut session = self.lock_session();
        self.shared.bump_generation(|snapshot| {
            let changed = snapshot.connection_state != ConnectionState::Disconnected;
            snapshot.connection_state = ConnectionState::Disconnected;
            changed
        });
        if let Some(previous) = session.take() {
            previous.stop();
            info!("disconnected from event stream");
        }
    }

    /// Empty all activity logs, metrics and terminal markers. Activities still
    /// waiting for a flush are dropped too. The connection is left alone.
    pub fn clear(&self) {
        self.shared.tx.send_modify(|snapshot| {
            self.shared.clear_epoch.fetch_add(1, Ordering::SeqCst);
            snapshot.activities.clear();
            snapshot.metrics.clear();
            snapshot.completed_subjects.clear();
            snapshot.failed_subjects.clear();
        });
    }

    /// Follow a change of the monitored subject set.
    ///
    /// The same set (in any order) is a no-op, an empty set disconnects, and a
    /// different set clears all state and reconnects.
    pub fn update_subjects<S: AsRef<str>>(&self, subject_ids: &[S]) {
        let next: Vec<String> = subject_ids.iter().map(|s| s.as_ref().to_string()).collect();
        if next.is_empty() {
            self.disconnect();
            return;
        }

        let current = self.subject_ids();
        let unchanged = !current.is_empty()
            && current.iter().collect::<HashSet<_>>() == next.iter().collect::<HashSet<_>>();
        if unchanged {
            return;
        }

        debug!(from = ?current, to = ?next, "subject set changed");
        self.clear();
        self.connect(&next);
    }

    /// Subjects of the current (or last) connection.
    pub fn subject_ids(&self) -> Vec<String> {
        self.lock_session()
            .as_ref()
            .map(|s| s.subject_ids.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        self.shared.tx.subscribe()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.shared.tx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.tx.borrow().connection_state
    }

    pub fn activities(&self, subject_id: &str) -> Vec<Activity> {
        self.shared
            .tx
            .borrow()
            .activities
            .get(subject_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn metrics(&self, subject_id: &str) -> Option<ExecutionMetrics> {
        self.shared.tx.borrow().metrics.get(subject_id).cloned()
    }

    pub fn completed_subjects(&self) -> HashSet<String> {
        self.shared.tx.borrow().completed_subjects.clone()
    }

    pub fn failed_subjects(&self) -> HashMap<String, String> {
        self.shared.tx.borrow().failed_subjects.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.shared.tx.borrow().error.clone()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StreamIngestor {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// State owned by one connection's task.
struct Session {
    shared: Arc<Shared>,
    transport: Arc<dyn PushTransport>,
    config: IngestorConfig,
    subject_ids: Vec<String>,
    generation: u64,
    cancel: CancellationToken,
    pending: PendingBuffer,
    gate: FlushGate,
    /// `clear_epoch` the pending buffer belongs to.
    epoch: u64,
}

impl Session {
    async fn run(mut self) {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempts: u32 = 0;

        loop {
            let Some(failure) = self.connect_once(&mut attempts).await else {
                return;
            };

            // Nothing buffered is held back while reconnecting.
            if !self.flush_when_allowed().await {
                return;
            }

            if matches!(failure, TransportError::Closed) && self.all_subjects_settled() {
                info!(subjects = ?self.subject_ids, "event stream finished");
                self.shared.update(self.generation, |s| {
                    s.connection_state = ConnectionState::Disconnected;
                });
                return;
            }

            if attempts >= max_attempts {
                error!(error = %failure, attempts, "event stream reconnect attempts exhausted");
                self.shared.update(self.generation, |s| {
                    s.connection_state = ConnectionState::Disconnected;
                    s.error = Some(format!(
                        "Connection failed after {} reconnect attempts: {}",
                        max_attempts, failure
                    ));
                });
                return;
            }

            attempts += 1;
            warn!(error = %failure, attempt = attempts, max_attempts, "event stream lost; reconnecting");
            self.shared.update(self.generation, |s| {
                s.connection_state = ConnectionState::Error;
                s.error = Some(format!(
                    "Connection lost ({}). Reconnecting (attempt {}/{})",
                    failure, attempts, max_attempts
                ));
            });

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }

            self.shared.update(self.generation, |s| {
                s.connection_state = ConnectionState::Connecting;
            });
        }
    }

    /// Open the connection and pump it until it fails. `None` means the
    /// session was cancelled.
    async fn connect_once(&mut self, attempts: &mut u32) -> Option<TransportError> {
        let cancel = self.cancel.clone();
        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            opened = self.transport.open(&self.subject_ids) => opened,
        };

        let mut source = match opened {
            Ok(source) => source,
            Err(e) => return Some(e),
        };

        *attempts = 0;
        info!(subjects = ?self.subject_ids, "event stream connected");
        self.shared.update(self.generation, |s| {
            s.connection_state = ConnectionState::Connected;
            s.error = None;
        });

        self.pump(source.as_mut()).await
    }

    async fn pump(&mut self, source: &mut dyn FrameSource) -> Option<TransportError> {
        let cancel = self.cancel.clone();
        let min_interval = self.gate.min_interval();
        let mut safety = tokio::time::interval_at(Instant::now() + min_interval, min_interval);
        safety.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.gate.scheduled();
            tokio::select! {
                _ = cancel.cancelled() => return None,
                frame = source.next_frame() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => return Some(e),
                    None => return Some(TransportError::Closed),
                },
                _ = sleep_until_deadline(deadline) => self.flush(Instant::now()),
                _ = safety.tick() => self.safety_flush(),
            }
        }
    }

    fn handle_frame(&mut self, frame: &str) {
        match decode_frame(frame) {
            Ok(event) => self.dispatch(event),
            Err(e) => {
                debug!(error = %e, "frame did not decode; keeping it as plain text");
                self.plain_text(frame);
            }
        }
    }

    fn dispatch(&mut self, event: StreamEvent) {
        let StreamEvent { subject_id, body } = event;
        trace!(subject = %subject_id, kind = body.kind().as_str(), "event");

        match body {
            EventBody::Activity(activity) => self.buffer(&subject_id, activity),
            EventBody::Metrics(metrics) => {
                self.shared.update(self.generation, |s| {
                    match s.metrics.get_mut(&subject_id) {
                        Some(current) => current.supersede(metrics),
                        None => {
                            s.metrics.insert(subject_id.clone(), metrics);
                        }
                    }
                });
            }
            EventBody::Log { message, result } => {
                let kind = if result {
                    ActivityKind::Result
                } else {
                    ActivityKind::Message
                };
                self.buffer(
                    &subject_id,
                    Activity::synthetic(kind, ActivityStatus::Success, message),
                );
            }
            EventBody::Complete { message } => {
                info!(subject = %subject_id, %message, "subject completed");
                self.shared.update(self.generation, |s| {
                    s.completed_subjects.insert(subject_id.clone());
                });
                self.buffer(
                    &subject_id,
                    Activity::synthetic(ActivityKind::Result, ActivityStatus::Success, message),
                );
            }
            EventBody::Error { message } => {
                warn!(subject = %subject_id, %message, "subject failed");
                self.shared.update(self.generation, |s| {
                    s.failed_subjects.insert(subject_id.clone(), message.clone());
                });
                self.buffer(
                    &subject_id,
                    Activity::synthetic(ActivityKind::Error, ActivityStatus::Error, message),
                );
            }
        }
    }

    /// Undecodable frames become message activities: for the subject named in
    /// the frame if there is one, otherwise for every subject of the connection.
    fn plain_text(&mut self, frame: &str) {
        let text = frame.trim();
        if text.is_empty() {
            return;
        }
        let targets = match subject_hint(text) {
            Some(subject_id) => vec![subject_id],
            None => self.subject_ids.clone(),
        };
        for subject_id in targets {
            self.buffer(
                &subject_id,
                Activity::synthetic(ActivityKind::Message, ActivityStatus::Success, text),
            );
        }
    }

    fn buffer(&mut self, subject_id: &str, activity: Activity) {
        let epoch = self.shared.clear_epoch.load(Ordering::SeqCst);
        if epoch != self.epoch {
            self.pending.clear();
            self.epoch = epoch;
        }

        self.pending.push(subject_id, activity);

        let now = Instant::now();
        if self.gate.on_pending(now) == FlushDecision::Now {
            self.flush(now);
        }
    }

    fn safety_flush(&mut self) {
        let now = Instant::now();
        if !self.pending.is_empty() && self.gate.ready(now) {
            self.flush(now);
        }
    }

    fn flush(&mut self, now: Instant) {
        if self.pending.is_empty() {
            self.gate.cancel_scheduled();
            return;
        }

        let batch = self.pending.take();
        let count: usize = batch.values().map(Vec::len).sum();
        let max_len = self.config.max_activities;
        let epoch = self.epoch;
        let shared = Arc::clone(&self.shared);

        let applied = shared.update_with(self.generation, |s| {
            // A clear() since these were buffered makes them stale.
            if shared.clear_epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            for (subject_id, activities) in batch {
                merge_activities(s.activities.entry(subject_id).or_default(), activities, max_len);
            }
            s.flushes += 1;
            true
        });

        self.gate.record_flush(now);
        trace!(count, applied, "flushed activities");
    }

    /// Flush the pending buffer as soon as the throttle allows. Returns `false`
    /// if the session was cancelled while waiting.
    async fn flush_when_allowed(&mut self) -> bool {
        if self.pending.is_empty() {
            self.gate.cancel_scheduled();
            return true;
        }
        if let Some(at) = self.gate.scheduled() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(at) => {}
            }
        }
        self.flush(Instant::now());
        true
    }

    fn all_subjects_settled(&self) -> bool {
        self.shared.tx.borrow().all_settled(&self.subject_ids)
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::transport::{ChannelTransport, FrameSender};
    use serde_json::json;

    fn activity_frame(subject: &str, id: &str, details: &str) -> String {
        json!({
            "subjectId": subject,
            "kind": "activity",
            "payload": {
                "id": id,
                "timestamp": "2024-01-01T00:00:00Z",
                "type": "tool",
                "details": details,
                "status": "pending"
            }
        })
        .to_string()
    }

    fn metrics_frame(subject: &str, iteration: u32, total_cost: f64) -> String {
        json!({
            "subjectId": subject,
            "kind": "metrics",
            "payload": {
                "iteration": iteration,
                "maxIterations": 10,
                "costUsd": 0.01,
                "durationMs": 500,
                "totalCostUsd": total_cost,
                "totalDurationMs": 1000
            }
        })
        .to_string()
    }

    fn test_config() -> IngestorConfig {
        IngestorConfig {
            throttle_rate: 10,
            max_activities: 500,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(3000),
        }
    }

    /// Let spawned tasks run without advancing the paused clock.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn send(tx: &FrameSender, frame: String) {
        tx.send(Ok(frame)).await.unwrap();
        settle().await;
    }

    async fn connected(
        subjects: &[&str],
        config: IngestorConfig,
    ) -> (StreamIngestor, Arc<ChannelTransport>, FrameSender) {
        let transport = Arc::new(ChannelTransport::new());
        let tx = transport.push_connection(64);
        let ingestor = StreamIngestor::with_transport(transport.clone(), config);
        ingestor.connect(subjects);
        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Connected);
        (ingestor, transport, tx)
    }

    fn ids(activities: &[Activity]) -> Vec<String> {
        activities.iter().map(|a| a.id.clone()).collect()
    }

    #[test]
    fn test_min_flush_interval() {
        assert_eq!(
            IngestorConfig::default().min_flush_interval(),
            Duration::from_millis(100)
        );
        let config = IngestorConfig {
            throttle_rate: 0,
            ..Default::default()
        };
        assert_eq!(config.min_flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_min_flush_interval_never_zero() {
        for throttle_rate in [1_000, 5_000, 2_000_000, u32::MAX] {
            let config = IngestorConfig {
                throttle_rate,
                ..Default::default()
            };
            assert_eq!(config.min_flush_interval(), Duration::from_millis(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_throttle_rate_keeps_session_alive() {
        let config = IngestorConfig {
            throttle_rate: 2_000_000,
            ..test_config()
        };
        let (ingestor, _transport, tx) = connected(&["run-1"], config).await;

        send(&tx, activity_frame("run-1", "a1", "first")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        settle().await;

        assert_eq!(ingestor.connection_state(), ConnectionState::Connected);
        assert_eq!(ingestor.activities("run-1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_no_subjects_is_noop() {
        let transport = Arc::new(ChannelTransport::new());
        let ingestor = StreamIngestor::with_transport(transport.clone(), test_config());
        ingestor.connect::<&str>(&[]);
        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Disconnected);
        assert!(transport.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sets_connecting_then_connected() {
        let transport = Arc::new(ChannelTransport::new());
        let _tx = transport.push_connection(8);
        let ingestor = StreamIngestor::with_transport(transport.clone(), test_config());

        ingestor.connect(&["run-1", "run-2"]);
        assert_eq!(ingestor.connection_state(), ConnectionState::Connecting);

        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Connected);
        assert_eq!(
            transport.opened(),
            vec![vec!["run-1".to_string(), "run-2".to_string()]]
        );
        assert_eq!(ingestor.subject_ids(), vec!["run-1", "run-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_activity_flushes_immediately() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;
        let mut rx = ingestor.subscribe();
        rx.borrow_and_update();

        send(&tx, activity_frame("run-1", "a1", "Reading: src/auth.rs")).await;

        assert!(rx.has_changed().unwrap());
        let log = ingestor.activities("run-1");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].details, "Reading: src/auth.rs");
        assert_eq!(ingestor.snapshot().flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_deferred_to_next_interval() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;

        send(&tx, activity_frame("run-1", "a0", "")).await;
        for i in 1..=5 {
            send(&tx, activity_frame("run-1", &format!("a{}", i), "")).await;
        }
        assert_eq!(ingestor.activities("run-1").len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ingestor.activities("run-1").len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            ids(&ingestor.activities("run-1")),
            vec!["a0", "a1", "a2", "a3", "a4", "a5"]
        );
        assert_eq!(ingestor.snapshot().flushes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_activity_replaces_in_place() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;

        send(&tx, activity_frame("run-1", "a1", "Running tests")).await;
        send(&tx, activity_frame("run-1", "a2", "Editing: src/lib.rs")).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        send(&tx, activity_frame("run-1", "a1", "Tests passed")).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let log = ingestor.activities("run-1");
        assert_eq!(ids(&log), vec!["a1", "a2"]);
        assert_eq!(log[0].details, "Tests passed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_is_capped_at_max_activities() {
        let config = IngestorConfig {
            max_activities: 5,
            ..test_config()
        };
        let (ingestor, _transport, tx) = connected(&["run-1"], config).await;

        for i in 0..12 {
            send(&tx, activity_frame("run-1", &format!("a{}", i), "")).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let log = ingestor.activities("run-1");
        assert_eq!(ids(&log), vec!["a7", "a8", "a9", "a10", "a11"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_apply_immediately_with_monotonic_totals() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;

        send(&tx, activity_frame("run-1", "a0", "")).await;
        send(&tx, metrics_frame("run-1", 2, 0.40)).await;
        let metrics = ingestor.metrics("run-1").unwrap();
        assert_eq!(metrics.iteration, 2);
        assert_eq!(metrics.total_cost_usd, 0.40);

        send(&tx, metrics_frame("run-1", 3, 0.25)).await;
        let metrics = ingestor.metrics("run-1").unwrap();
        assert_eq!(metrics.iteration, 3);
        assert_eq!(metrics.total_cost_usd, 0.40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_events_mark_subjects_and_emit_activities() {
        let (ingestor, _transport, tx) = connected(&["run-1", "run-2"], test_config()).await;

        send(
            &tx,
            json!({"subjectId": "run-1", "kind": "complete", "payload": {"message": "PR #12 opened"}})
                .to_string(),
        )
        .await;
        send(
            &tx,
            json!({"subjectId": "run-2", "kind": "error", "payload": {"message": "Budget exhausted"}})
                .to_string(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(ingestor.completed_subjects().contains("run-1"));
        assert_eq!(
            ingestor.failed_subjects().get("run-2").map(String::as_str),
            Some("Budget exhausted")
        );

        let done = ingestor.activities("run-1");
        assert_eq!(done.last().unwrap().kind, ActivityKind::Result);
        assert_eq!(done.last().unwrap().details, "PR #12 opened");

        let failed = ingestor.activities("run-2");
        assert_eq!(failed.last().unwrap().kind, ActivityKind::Error);
        assert_eq!(failed.last().unwrap().status, ActivityStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_events_become_activities() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;

        send(&tx, json!({"subjectId": "run-1", "kind": "log", "payload": "cargo build"}).to_string()).await;
        send(
            &tx,
            json!({"subjectId": "run-1", "kind": "log", "payload": {"message": "Fixed 2 findings", "result": true}})
                .to_string(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let log = ingestor.activities("run-1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, ActivityKind::Message);
        assert_eq!(log[0].details, "cargo build");
        assert_eq!(log[1].kind, ActivityKind::Result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_fall_back_to_plain_text() {
        let (ingestor, _transport, tx) = connected(&["a", "b"], test_config()).await;

        send(&tx, "Cloning repository...".to_string()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        send(&tx, json!({"subjectId": "a", "kind": "telemetry"}).to_string()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let a = ingestor.activities("a");
        let b = ingestor.activities("b");
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].details, "Cloning repository...");
        assert_eq!(a[0].kind, ActivityKind::Message);
        assert_eq!(b[0].details, "Cloning repository...");
        assert!(a[1].details.contains("telemetry"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_failures_then_recovers() {
        let transport = Arc::new(ChannelTransport::new());
        transport.push_failure(TransportError::Other("connection refused".to_string()));
        transport.push_failure(TransportError::Other("connection refused".to_string()));
        let _tx = transport.push_connection(8);

        let ingestor = StreamIngestor::with_transport(transport.clone(), test_config());
        ingestor.connect(&["run-1"]);
        settle().await;

        assert_eq!(ingestor.connection_state(), ConnectionState::Error);
        assert!(ingestor.error().unwrap().contains("attempt 1/3"));

        tokio::time::sleep(Duration::from_millis(3100)).await;
        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Error);
        assert!(ingestor.error().unwrap().contains("attempt 2/3"));

        tokio::time::sleep(Duration::from_millis(3100)).await;
        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Connected);
        assert_eq!(ingestor.error(), None);
        assert_eq!(transport.opened().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_reconnect_attempts_disconnects_on_first_failure() {
        let transport = Arc::new(ChannelTransport::new());
        transport.push_failure(TransportError::Other("connection refused".to_string()));
        let config = IngestorConfig {
            max_reconnect_attempts: 0,
            ..test_config()
        };

        let ingestor = StreamIngestor::with_transport(transport.clone(), config);
        ingestor.connect(&["run-1"]);
        settle().await;

        assert_eq!(ingestor.connection_state(), ConnectionState::Disconnected);
        assert!(ingestor.error().unwrap().contains("Connection failed"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opened().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_stop_for_good() {
        // Empty queue: every open fails.
        let transport = Arc::new(ChannelTransport::new());
        let config = IngestorConfig {
            max_reconnect_attempts: 2,
            ..test_config()
        };

        let ingestor = StreamIngestor::with_transport(transport.clone(), config);
        ingestor.connect(&["run-1"]);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(ingestor.connection_state(), ConnectionState::Disconnected);
        assert!(ingestor.error().unwrap().contains("after 2 reconnect attempts"));
        assert_eq!(transport.opened().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_flushes_pending_and_reconnects() {
        let transport = Arc::new(ChannelTransport::new());
        let tx = transport.push_connection(8);
        let _tx2 = transport.push_connection(8);

        let ingestor = StreamIngestor::with_transport(transport.clone(), test_config());
        ingestor.connect(&["run-1"]);
        settle().await;

        send(&tx, activity_frame("run-1", "a0", "")).await;
        send(&tx, activity_frame("run-1", "a1", "")).await;
        drop(tx);
        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Error);
        assert_eq!(ids(&ingestor.activities("run-1")), vec!["a0", "a1"]);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Connected);
        assert_eq!(transport.opened().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_after_all_subjects_settled_does_not_reconnect() {
        let (ingestor, transport, tx) = connected(&["run-1"], test_config()).await;

        send(&tx, json!({"subjectId": "run-1", "kind": "complete"}).to_string()).await;
        drop(tx);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(ingestor.connection_state(), ConnectionState::Disconnected);
        assert_eq!(ingestor.error(), None);
        assert_eq!(transport.opened().len(), 1);
        assert_eq!(ingestor.activities("run-1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_scheduled_flush() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;

        send(&tx, activity_frame("run-1", "a0", "")).await;
        send(&tx, activity_frame("run-1", "a1", "")).await;
        ingestor.disconnect();
        ingestor.disconnect();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Disconnected);
        assert_eq!(ids(&ingestor.activities("run-1")), vec!["a0"]);
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let transport = Arc::new(ChannelTransport::new());
        let ingestor = StreamIngestor::with_transport(transport.clone(), test_config());
        ingestor.connect(&["run-1"]);
        settle().await;
        assert_eq!(ingestor.connection_state(), ConnectionState::Error);

        ingestor.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.opened().len(), 1);
        assert_eq!(ingestor.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replaces_previous_connection() {
        let transport = Arc::new(ChannelTransport::new());
        let first = transport.push_connection(8);
        let second = transport.push_connection(8);
        let ingestor = StreamIngestor::with_transport(transport.clone(), test_config());

        ingestor.connect(&["run-1"]);
        settle().await;
        ingestor.connect(&["run-1"]);
        settle().await;

        assert!(first.is_closed());
        assert!(!second.is_closed());

        // Frames from the replaced connection can no longer arrive; the new
        // one is live.
        send(&second, activity_frame("run-1", "fresh", "")).await;
        assert_eq!(ids(&ingestor.activities("run-1")), vec!["fresh"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_keeps_connection() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;

        send(&tx, activity_frame("run-1", "a0", "")).await;
        send(&tx, activity_frame("run-1", "a1", "")).await;
        send(&tx, metrics_frame("run-1", 1, 0.1)).await;
        ingestor.clear();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = ingestor.snapshot();
        assert!(snapshot.activities.values().all(Vec::is_empty));
        assert!(snapshot.metrics.is_empty());
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);

        send(&tx, activity_frame("run-1", "a2", "")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ids(&ingestor.activities("run-1")), vec!["a2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_subjects_transitions() {
        let transport = Arc::new(ChannelTransport::new());
        let tx = transport.push_connection(8);
        let _tx2 = transport.push_connection(8);
        let ingestor = StreamIngestor::with_transport(transport.clone(), test_config());

        ingestor.update_subjects(&["a", "b"]);
        settle().await;
        send(&tx, activity_frame("a", "a0", "")).await;

        ingestor.update_subjects(&["b", "a"]);
        settle().await;
        assert_eq!(transport.opened().len(), 1);
        assert_eq!(ingestor.activities("a").len(), 1);

        ingestor.update_subjects(&["c"]);
        settle().await;
        assert_eq!(transport.opened().len(), 2);
        assert!(ingestor.activities("a").is_empty());
        assert_eq!(ingestor.connection_state(), ConnectionState::Connected);

        ingestor.update_subjects::<&str>(&[]);
        assert_eq!(ingestor.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down_connection() {
        let (ingestor, _transport, tx) = connected(&["run-1"], test_config()).await;
        drop(ingestor);
        settle().await;
        assert!(tx.is_closed());
    }

    #[test]
    fn test_snapshot_settled() {
        let mut snapshot = StreamSnapshot::default();
        let subjects = vec!["a".to_string(), "b".to_string()];
        assert!(!snapshot.all_settled(&subjects));
        snapshot.completed_subjects.insert("a".to_string());
        snapshot
            .failed_subjects
            .insert("b".to_string(), "boom".to_string());
        assert!(snapshot.all_settled(&subjects));
        assert!(!snapshot.all_settled(&[]));
    }
}
