//! Background driver.
//!
//! [`BuildScheduler`] runs `worker_threads` threads that keep asking the
//! builder for the next admitted and claimed build and run it. What happens
//! after a build depends on how it ended:
//!
//! - `BUILD_RETRY`: the worker selects again right away;
//! - `BUILD_FAIL` (and storage errors): the pair is retried with exponential
//!   backoff and given up after `max_build_failures` attempts;
//! - `META_ERROR` / `MISCONFIGURED`: the pair is left alone until the table
//!   metadata version changes;
//! - cancellation: the worker pauses while the gate is blocked.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::admission::BuildMode;
use crate::builder::VectorIndexBuilder;
use crate::config::BuilderSettings;
use crate::error::{PartIndexError, Result};
use crate::events::BuildOutcome;
use crate::metadata::VectorIndexDescription;
use crate::part::DataPart;
use crate::status::BuildStatus;

type PairKey = (String, String);

/// One build run by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildAttempt {
    pub part_name: String,
    pub index_name: String,
    pub mode: BuildMode,
    pub outcome: BuildOutcome,
}

#[derive(Debug, Clone)]
struct FailureState {
    failures: u32,
    retry_at: Instant,
}

/// Per-pair memory of failed and misconfigured builds.
#[derive(Debug, Default)]
struct RetryPolicy {
    failures: HashMap<PairKey, FailureState>,
    /// Metadata version under which the pair hit a configuration error.
    config_errors: HashMap<PairKey, u64>,
}

impl RetryPolicy {
    fn should_skip(&self, key: &PairKey, metadata_version: u64, settings: &BuilderSettings) -> bool {
        if self.config_errors.get(key) == Some(&metadata_version) {
            return true;
        }
        match self.failures.get(key) {
            Some(state) => {
                state.failures >= settings.max_build_failures || Instant::now() < state.retry_at
            }
            None => false,
        }
    }

    fn backoff(failures: u32, settings: &BuilderSettings) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let millis = settings
            .retry_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(settings.max_retry_backoff_ms);
        Duration::from_millis(millis)
    }

    fn record(&mut self, key: PairKey, outcome: &BuildOutcome, metadata_version: u64, settings: &BuilderSettings) {
        match outcome {
            BuildOutcome::Status(status) if status.is_config_error() => {
                self.config_errors.insert(key, metadata_version);
            }
            BuildOutcome::Status(BuildStatus::BuildFail) | BuildOutcome::Failed(_) => {
                let state = self.failures.entry(key.clone()).or_insert(FailureState {
                    failures: 0,
                    retry_at: Instant::now(),
                });
                state.failures += 1;
                state.retry_at = Instant::now() + Self::backoff(state.failures, settings);
                if state.failures >= settings.max_build_failures {
                    error!(
                        "giving up on vector index {} of part {} after {} failed builds",
                        key.1, key.0, state.failures
                    );
                }
            }
            BuildOutcome::Status(BuildStatus::BuildRetry) | BuildOutcome::Cancelled => {}
            BuildOutcome::Status(_) => {
                self.failures.remove(&key);
                self.config_errors.remove(&key);
            }
        }
    }
}

/// Drives a [`VectorIndexBuilder`] from background threads.
#[derive(Debug)]
pub struct BuildScheduler {
    builder: Arc<VectorIndexBuilder>,
    policy: Arc<Mutex<RetryPolicy>>,
    running: Arc<AtomicBool>,
    /// Dropping the sender wakes and stops every worker.
    stop: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Metadata version of the last reaper pass.
    reaped_version: Arc<AtomicU64>,
}

impl BuildScheduler {
    pub fn new(builder: Arc<VectorIndexBuilder>) -> Self {
        BuildScheduler {
            builder,
            policy: Arc::new(Mutex::new(RetryPolicy::default())),
            running: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            reaped_version: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }

    pub fn builder(&self) -> &Arc<VectorIndexBuilder> {
        &self.builder
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the worker threads. Stale scratch directories are removed first.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(PartIndexError::InvalidOperation(
                "build scheduler already running".to_string(),
            ));
        }
        self.builder.cleanup_scratch()?;

        let (sender, receiver) = bounded::<()>(0);
        *self.stop.lock() = Some(sender);

        let worker_threads = self.builder.settings().load().worker_threads;
        let mut workers = self.workers.lock();
        for worker_id in 0..worker_threads {
            workers.push(self.spawn_worker(worker_id, receiver.clone())?);
        }
        info!("started {worker_threads} vector index build workers");
        Ok(())
    }

    /// Stop the workers and wait for them. Running builds finish first; block
    /// the gate beforehand to cancel them.
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.stop.lock().take();

        let mut workers = self.workers.lock();
        while let Some(worker) = workers.pop() {
            if worker.join().is_err() {
                warn!("vector index build worker panicked");
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, worker_id: usize, stop: Receiver<()>) -> Result<thread::JoinHandle<()>> {
        let step = Step {
            builder: self.builder.clone(),
            policy: self.policy.clone(),
            reaped_version: self.reaped_version.clone(),
        };
        let running = self.running.clone();
        let prefer_slow = worker_id % 2 == 1;

        let handle = thread::Builder::new()
            .name(format!("vector-index-{worker_id}"))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    let idle = Duration::from_millis(step.builder.settings().load().idle_sleep_ms);
                    if worker_id == 0 {
                        step.reap_if_metadata_changed();
                    }

                    let ran = step.run_once(prefer_slow, &|_, _| false);
                    let pause = match &ran {
                        Some(attempt) if attempt.outcome == BuildOutcome::Cancelled => true,
                        Some(_) => false,
                        None => true,
                    };
                    if !pause {
                        continue;
                    }
                    match stop.recv_timeout(idle) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("vector index build worker {worker_id} stopped");
            })?;
        Ok(handle)
    }

    /// Run at most one build synchronously, preferring the given mode and
    /// falling back to the other one. `None` if nothing could be scheduled.
    pub fn run_once(&self, prefer_slow: bool) -> Option<BuildAttempt> {
        self.run_once_with(prefer_slow, &|_, _| false)
    }

    /// Like [`run_once`](Self::run_once), also passing over pairs for which
    /// `skip` returns true.
    pub fn run_once_with(
        &self,
        prefer_slow: bool,
        skip: &dyn Fn(&DataPart, &VectorIndexDescription) -> bool,
    ) -> Option<BuildAttempt> {
        self.step().run_once(prefer_slow, skip)
    }

    /// Run builds until nothing is left to schedule or `max_builds` ran.
    pub fn run_until_idle(
        &self,
        max_builds: usize,
        skip: &dyn Fn(&DataPart, &VectorIndexDescription) -> bool,
    ) -> Vec<BuildAttempt> {
        let step = self.step();
        let mut attempts = Vec::new();
        while attempts.len() < max_builds {
            match step.run_once(false, skip) {
                Some(attempt) => {
                    let cancelled = attempt.outcome == BuildOutcome::Cancelled;
                    attempts.push(attempt);
                    if cancelled {
                        break;
                    }
                }
                None => break,
            }
        }
        attempts
    }

    /// Forget failure and configuration-error history.
    pub fn reset_failures(&self) {
        let mut policy = self.policy.lock();
        policy.failures.clear();
        policy.config_errors.clear();
    }

    fn step(&self) -> Step {
        Step {
            builder: self.builder.clone(),
            policy: self.policy.clone(),
            reaped_version: self.reaped_version.clone(),
        }
    }
}

impl Drop for BuildScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// State a worker needs for one scheduling step.
struct Step {
    builder: Arc<VectorIndexBuilder>,
    policy: Arc<Mutex<RetryPolicy>>,
    reaped_version: Arc<AtomicU64>,
}

impl Step {
    fn run_once(
        &self,
        prefer_slow: bool,
        skip: &dyn Fn(&DataPart, &VectorIndexDescription) -> bool,
    ) -> Option<BuildAttempt> {
        let settings = self.builder.settings().load();
        let version = self.builder.registry().metadata().version;
        let policy_skip = |part: &DataPart, description: &VectorIndexDescription| {
            let key = (part.name.clone(), description.name.clone());
            skip(part, description) || self.policy.lock().should_skip(&key, version, &settings)
        };

        let scheduled = self
            .builder
            .schedule_next(prefer_slow, &policy_skip)
            .or_else(|| self.builder.schedule_next(!prefer_slow, &policy_skip))?;

        let part_name = scheduled.task.part.name.clone();
        let index_name = scheduled.task.index.name.clone();
        let mode = scheduled.mode();
        let metadata_version = scheduled.metadata.version;

        let outcome = match self.builder.run(scheduled) {
            Ok(status) => BuildOutcome::Status(status),
            Err(e) if e.is_cancelled() => BuildOutcome::Cancelled,
            Err(e) => BuildOutcome::Failed(e.to_string()),
        };
        self.policy.lock().record(
            (part_name.clone(), index_name.clone()),
            &outcome,
            metadata_version,
            &settings,
        );

        Some(BuildAttempt {
            part_name,
            index_name,
            mode,
            outcome,
        })
    }

    fn reap_if_metadata_changed(&self) {
        let version = self.builder.registry().metadata().version;
        if self.reaped_version.load(Ordering::Acquire) == version {
            return;
        }
        match self.builder.remove_dropped_vector_indices() {
            Ok(report) if report.skipped_claimed == 0 => {
                self.reaped_version.store(version, Ordering::Release);
            }
            Ok(_) => {}
            Err(e) => warn!("cannot remove dropped vector indices: {e}"),
        }
    }
}
