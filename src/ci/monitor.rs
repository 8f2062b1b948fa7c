//! CI polling monitor.
//!
//! A [`CiMonitor`] polls the CI status of one (branch, sha) target until the
//! derived overall status is terminal, then stops and fires the completion
//! callbacks. One spawned task per polling run drives both the poll timer and
//! the countdown; it is tagged with a generation number so that a stopped or
//! retargeted run can never write into the snapshot again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fixwatch_common::{CiCheck, CiOverallStatus, CiStatus, FixRequest, FixResponse, failed_checks};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{CiApi, HttpCiApi};
use crate::errors::CiApiError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(15_000);
pub const DEFAULT_MAX_RETRIES: u32 = 40;

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// The commit being watched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CiTarget {
    pub branch: String,
    pub sha: String,
    /// With `repo`, selects the `?sha=&owner=&repo=` form of the status query.
    pub owner: Option<String>,
    pub repo: Option<String>,
}

impl CiTarget {
    pub fn new(branch: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            sha: sha.into(),
            owner: None,
            repo: None,
        }
    }

    pub fn with_repository(mut self, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self.repo = Some(repo.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// When false, `start_polling` does nothing.
    pub enabled: bool,
    pub interval: Duration,
    /// Polls allowed per run before giving up.
    pub max_retries: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    #[default]
    Idle,
    Polling,
    Waiting,
    Error,
}

impl PollState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Waiting => "waiting",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the monitor publishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSnapshot {
    pub target: CiTarget,
    pub state: PollState,
    /// Latest fetched status, replaced wholesale on every successful poll.
    pub status: Option<CiStatus>,
    /// Polls made in the current run.
    pub poll_count: u32,
    pub error: Option<String>,
    pub is_polling: bool,
    pub next_poll_at: Option<Instant>,
    /// Whole seconds until the next poll, refreshed once a second while
    /// waiting.
    pub countdown_secs: u64,
}

impl MonitorSnapshot {
    pub fn failed_checks(&self) -> Vec<CiCheck> {
        self.status
            .as_ref()
            .map(CiStatus::failed_checks)
            .unwrap_or_default()
    }

    pub fn seconds_until_next_poll(&self, now: Instant) -> u64 {
        self.next_poll_at
            .map(|at| seconds_until(at, now))
            .unwrap_or(0)
    }
}

fn seconds_until(at: Instant, now: Instant) -> u64 {
    let millis = at.saturating_duration_since(now).as_millis();
    u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX)
}

pub type CompleteCallback = Arc<dyn Fn(CiOverallStatus, &[CiCheck]) + Send + Sync>;
pub type AutoFixCallback = Arc<dyn Fn(&[CiCheck]) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    on_complete: Option<CompleteCallback>,
    on_auto_fix: Option<AutoFixCallback>,
}

struct Shared {
    tx: watch::Sender<MonitorSnapshot>,
    generation: AtomicU64,
}

impl Shared {
    fn update(&self, generation: u64, f: impl FnOnce(&mut MonitorSnapshot)) -> bool {
        self.tx.send_if_modified(|snapshot| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            f(snapshot);
            true
        })
    }

    fn bump_generation(&self, f: impl FnOnce(&mut MonitorSnapshot) -> bool) -> u64 {
        let mut generation = 0;
        self.tx.send_if_modified(|snapshot| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            f(snapshot)
        });
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Target and generation, read together.
    fn current(&self) -> (CiTarget, u64) {
        let snapshot = self.tx.borrow();
        (
            snapshot.target.clone(),
            self.generation.load(Ordering::SeqCst),
        )
    }
}

struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Polls CI for one target.
///
/// `start_polling` must be called from within a tokio runtime.
pub struct CiMonitor {
    api: Arc<dyn CiApi>,
    config: MonitorConfig,
    callbacks: Callbacks,
    shared: Arc<Shared>,
    poller: Mutex<Option<PollHandle>>,
}

impl CiMonitor {
    pub fn new<A: CiApi>(api: A, target: CiTarget, config: MonitorConfig) -> Self {
        Self::with_api(Arc::new(api), target, config)
    }

    pub fn with_api(api: Arc<dyn CiApi>, target: CiTarget, config: MonitorConfig) -> Self {
        let (tx, _rx) = watch::channel(MonitorSnapshot {
            target,
            ..Default::default()
        });
        Self {
            api,
            config,
            callbacks: Callbacks::default(),
            shared: Arc::new(Shared {
                tx,
                generation: AtomicU64::new(0),
            }),
            poller: Mutex::new(None),
        }
    }

    /// Monitor backed by the dashboard HTTP API at `base_url`.
    pub fn http(base_url: impl Into<String>, target: CiTarget, config: MonitorConfig) -> Self {
        Self::new(HttpCiApi::new(base_url), target, config)
    }

    /// Called once per run when a terminal status is reached.
    pub fn on_complete(
        mut self,
        f: impl Fn(CiOverallStatus, &[CiCheck]) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_complete = Some(Arc::new(f));
        self
    }

    /// Called with the failed checks when a run ends in `failure` or `mixed`.
    pub fn on_auto_fix(mut self, f: impl Fn(&[CiCheck]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_auto_fix = Some(Arc::new(f));
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Poll now and then every `interval` until a terminal status. No-op if
    /// already polling or disabled. Each run starts with a fresh poll count.
    pub fn start_polling(&self) {
        if !self.config.enabled {
            debug!("CI monitoring disabled; not polling");
            return;
        }

        let mut poller = self.lock_poller();
        if self.shared.tx.borrow().is_polling {
            debug!("already polling");
            return;
        }

        let generation = self.shared.bump_generation(|s| {
            s.is_polling = true;
            s.poll_count = 0;
            s.error = None;
            s.next_poll_at = None;
            s.countdown_secs = 0;
            true
        });
        if let Some(previous) = poller.take() {
            previous.stop();
        }

        let (target, _) = self.shared.current();
        info!(branch = %target.branch, sha = %target.sha, interval_ms = self.config.interval.as_millis() as u64, "starting CI polling");

        let cancel = CancellationToken::new();
        let run = PollRun {
            api: Arc::clone(&self.api),
            shared: Arc::clone(&self.shared),
            callbacks: self.callbacks.clone(),
            config: self.config.clone(),
            target,
            generation,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.run());
        *poller = Some(PollHandle { cancel, task });
    }

    /// Cancel the poll timer and any in-flight poll; back to idle. Idempotent.
    pub fn stop_polling(&self) {
        let mut poller = self.lock_poller();
        self.shared.bump_generation(|s| {
            let changed = s.is_polling || s.state != PollState::Idle || s.next_poll_at.is_some();
            s.is_polling = false;
            s.state = PollState::Idle;
            s.next_poll_at = None;
            s.countdown_secs = 0;
            changed
        });
        if let Some(previous) = poller.take() {
            previous.stop();
            debug!("CI polling stopped");
        }
    }

    /// Watch a different commit, keeping the owner/repo of the current target.
    pub fn set_target(&self, branch: impl Into<String>, sha: impl Into<String>) {
        let (current, _) = self.shared.current();
        self.retarget(CiTarget {
            branch: branch.into(),
            sha: sha.into(),
            ..current
        });
    }

    /// Replace the target. A different target stops polling and clears the
    /// status, poll count and error; polling is not resumed. The same target
    /// is a no-op.
    pub fn retarget(&self, target: CiTarget) {
        let mut poller = self.lock_poller();
        if self.shared.tx.borrow().target == target {
            return;
        }

        info!(branch = %target.branch, sha = %target.sha, "CI target changed");
        self.shared.bump_generation(|s| {
            *s = MonitorSnapshot {
                target,
                ..Default::default()
            };
            true
        });
        if let Some(previous) = poller.take() {
            previous.stop();
        }
    }

    /// One poll outside the periodic cycle. Replaces `status` or `error` like a
    /// regular poll, but leaves the poll count and polling flag alone and fires
    /// no callbacks.
    pub async fn refresh(&self) -> Result<CiStatus, CiApiError> {
        let (target, generation) = self.shared.current();
        let result = self
            .api
            .fetch_status(&target)
            .await
            .map(CiStatus::with_derived_status);

        match &result {
            Ok(status) => {
                let status = status.clone();
                self.shared.update(generation, |s| {
                    s.status = Some(status);
                    s.error = None;
                });
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "CI refresh failed");
                self.shared.update(generation, |s| s.error = Some(message));
            }
        }
        result
    }

    /// Ask the server to fix the currently failing checks on behalf of
    /// `subject_id`.
    ///
    /// Without a status or without failures nothing is sent. When the server
    /// pushes a new commit, the monitor moves to it and polls again from zero.
    pub async fn trigger_auto_fix(&self, subject_id: &str) -> FixResponse {
        let (target, generation) = self.shared.current();
        let Some(status) = self.status() else {
            return FixResponse::not_attempted("No CI status available");
        };
        let failed = failed_checks(&status.checks);
        if failed.is_empty() {
            return FixResponse::not_attempted("No failed checks to fix");
        }

        let request = FixRequest {
            subject_id: subject_id.to_string(),
            sha: target.sha.clone(),
            branch: target.branch.clone(),
            failed_checks: failed.iter().map(|c| c.name.clone()).collect(),
        };
        info!(subject = %subject_id, checks = ?request.failed_checks, "requesting auto-fix");

        match self.api.request_fix(&request).await {
            Ok(response) => {
                if response.success
                    && let Some(new_sha) = response.new_commit_sha.clone()
                    && self.shared.current().1 == generation
                {
                    info!(sha = %new_sha, "auto-fix pushed a new commit; polling it");
                    self.retarget(CiTarget {
                        sha: new_sha,
                        ..target
                    });
                    self.start_polling();
                }
                response
            }
            Err(e) => {
                let message = format!("Auto-fix request failed: {}", e);
                warn!(error = %e, "auto-fix request failed");
                let recorded = message.clone();
                self.shared.update(generation, |s| s.error = Some(recorded));
                FixResponse::not_attempted(message)
            }
        }
    }

    /// Checks with a `failure` conclusion in the current status.
    pub fn get_failed_checks(&self) -> Vec<CiCheck> {
        self.shared.tx.borrow().failed_checks()
    }

    pub fn seconds_until_next_poll(&self) -> u64 {
        self.shared
            .tx
            .borrow()
            .seconds_until_next_poll(Instant::now())
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.shared.tx.subscribe()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.shared.tx.borrow().clone()
    }

    pub fn target(&self) -> CiTarget {
        self.shared.tx.borrow().target.clone()
    }

    pub fn state(&self) -> PollState {
        self.shared.tx.borrow().state
    }

    pub fn status(&self) -> Option<CiStatus> {
        self.shared.tx.borrow().status.clone()
    }

    pub fn poll_count(&self) -> u32 {
        self.shared.tx.borrow().poll_count
    }

    pub fn error(&self) -> Option<String> {
        self.shared.tx.borrow().error.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.tx.borrow().is_polling
    }

    fn lock_poller(&self) -> MutexGuard<'_, Option<PollHandle>> {
        self.poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for CiMonitor {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

enum Flow {
    Continue,
    Stop,
}

/// One polling run.
struct PollRun {
    api: Arc<dyn CiApi>,
    shared: Arc<Shared>,
    callbacks: Callbacks,
    config: MonitorConfig,
    target: CiTarget,
    generation: u64,
    cancel: CancellationToken,
}

impl PollRun {
    async fn run(self) {
        loop {
            if let Flow::Stop = self.poll_once().await {
                return;
            }

            let next = Instant::now() + self.config.interval;
            let waiting = self.shared.update(self.generation, |s| {
                s.state = PollState::Waiting;
                s.next_poll_at = Some(next);
                s.countdown_secs = seconds_until(next, Instant::now());
            });
            if !waiting || !self.wait_until(next).await {
                return;
            }
        }
    }

    async fn poll_once(&self) -> Flow {
        let max_retries = self.config.max_retries;
        let mut exhausted = false;
        let live = self.shared.update(self.generation, |s| {
            s.next_poll_at = None;
            s.countdown_secs = 0;
            if s.poll_count >= max_retries {
                exhausted = true;
                s.state = PollState::Error;
                s.is_polling = false;
                s.error = Some(format!("Maximum polling attempts ({}) reached", max_retries));
            } else {
                s.poll_count += 1;
                s.state = PollState::Polling;
            }
        });
        if !live {
            return Flow::Stop;
        }
        if exhausted {
            error!(max_retries, sha = %self.target.sha, "CI polling gave up");
            return Flow::Stop;
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Flow::Stop,
            result = self.api.fetch_status(&self.target) => result,
        };

        match result {
            Ok(status) => self.apply_status(status.with_derived_status()),
            Err(e) => {
                warn!(error = %e, "CI status poll failed");
                let message = e.to_string();
                if self.shared.update(self.generation, |s| s.error = Some(message)) {
                    Flow::Continue
                } else {
                    Flow::Stop
                }
            }
        }
    }

    fn apply_status(&self, status: CiStatus) -> Flow {
        let overall = status.overall_status;
        if !overall.is_terminal() {
            debug!(status = %overall, checks = status.checks.len(), "CI still in progress");
            let live = self.shared.update(self.generation, |s| {
                s.status = Some(status);
                s.error = None;
            });
            return if live { Flow::Continue } else { Flow::Stop };
        }

        let checks = status.checks.clone();
        let live = self.shared.update(self.generation, |s| {
            s.status = Some(status);
            s.error = None;
            s.state = PollState::Idle;
            s.is_polling = false;
        });
        if !live {
            return Flow::Stop;
        }

        info!(status = %overall, sha = %self.target.sha, "CI finished");
        // A stop or retarget may land between the update and each callback.
        if let Some(on_complete) = &self.callbacks.on_complete
            && self.shared.is_current(self.generation)
        {
            on_complete(overall, &checks);
        }
        if overall.is_failing()
            && let Some(on_auto_fix) = &self.callbacks.on_auto_fix
            && self.shared.is_current(self.generation)
        {
            on_auto_fix(&failed_checks(&checks));
        }
        Flow::Stop
    }

    /// Sleep until `next`, refreshing the countdown every second. Returns
    /// `false` if the run was cancelled or superseded meanwhile.
    async fn wait_until(&self, next: Instant) -> bool {
        let mut ticker = tokio::time::interval_at(Instant::now() + COUNTDOWN_TICK, COUNTDOWN_TICK);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(next) => return true,
                _ = ticker.tick() => {
                    let remaining = seconds_until(next, Instant::now());
                    if !self.shared.update(self.generation, |s| s.countdown_secs = remaining) {
                        return false;
                    }
                }
            }
        }
    }
}
