//! Fixed-size pool of worker threads, each bound to one authenticated profile.
//!
//! Jobs flow through a single FIFO [`JobQueue`]; their records live in a
//! [`JobStore`] that every worker and caller shares. A worker owns its driver
//! and pipeline outright, so nothing session-related crosses threads.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::config::{AppConfig, PipelineSettings, PoolSettings};
use crate::models::generation::GenerationOutcome;
use crate::models::job::{Job, JobCounts, JobId, JobPayload};
use crate::services::clock::Clock;
use crate::services::driver::{AutomationDriver, DriverFactory};
use crate::services::pipeline::{GenerationPipeline, PipelineError, PipelineState};
use crate::services::profiles::{assign_profiles, ProfileError, ProfileRegistry, WorkerBinding};
use crate::services::queue::{JobQueue, Popped};
use crate::services::reporter::{Reporter, WorkerReporter};
use crate::services::store::JobStore;

/// Callbacks fired around each job a worker runs.
pub trait JobObserver: Send + Sync {
    fn job_started(&self, _job: &Job) {}

    /// Called once a job reaches a terminal status, cancellations included.
    fn job_finished(&self, _job: &Job) {}
}

/// Everything a worker thread needs, shared across one pool run.
struct WorkerContext {
    store: Arc<JobStore>,
    queue: JobQueue,
    registry: Arc<Mutex<ProfileRegistry>>,
    factory: Arc<dyn DriverFactory>,
    pipeline: PipelineSettings,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn JobObserver>>,
    running: Arc<AtomicBool>,
    inter_job_delay: Duration,
    queue_poll: Duration,
}

pub struct WorkerPool {
    store: Arc<JobStore>,
    queue: JobQueue,
    registry: Arc<Mutex<ProfileRegistry>>,
    factory: Arc<dyn DriverFactory>,
    settings: PoolSettings,
    pipeline: PipelineSettings,
    clock: Arc<dyn Clock>,
    reporter: Reporter,
    observer: Option<Arc<dyn JobObserver>>,
    running: Arc<AtomicBool>,
    bindings: Vec<WorkerBinding>,
    handles: Vec<JoinHandle<()>>,
    exited: Option<Receiver<usize>>,
}

impl WorkerPool {
    pub fn new(
        registry: Arc<Mutex<ProfileRegistry>>,
        factory: Arc<dyn DriverFactory>,
        settings: PoolSettings,
        pipeline: PipelineSettings,
        clock: Arc<dyn Clock>,
        reporter: Reporter,
    ) -> Self {
        Self {
            store: Arc::new(JobStore::new()),
            queue: JobQueue::new(),
            registry,
            factory,
            settings,
            pipeline,
            clock,
            reporter,
            observer: None,
            running: Arc::new(AtomicBool::new(false)),
            bindings: Vec::new(),
            handles: Vec::new(),
            exited: None,
        }
    }

    /// Open the profile registry under `config.profiles_dir` and build a pool
    /// from the configured settings.
    pub fn from_config(
        config: &AppConfig,
        factory: Arc<dyn DriverFactory>,
        clock: Arc<dyn Clock>,
        reporter: Reporter,
    ) -> Result<Self, PoolError> {
        let registry = ProfileRegistry::open(&config.profiles_dir)?;
        Ok(Self::new(
            Arc::new(Mutex::new(registry)),
            factory,
            config.pool_settings(),
            config.pipeline_settings(),
            clock,
            reporter,
        ))
    }

    pub fn registry(&self) -> &Arc<Mutex<ProfileRegistry>> {
        &self.registry
    }

    /// Install an observer. Takes effect at the next `start`.
    pub fn set_observer(&mut self, observer: Arc<dyn JobObserver>) {
        self.observer = Some(observer);
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Record a Pending job and queue it behind everything already queued.
    pub fn add_job(&self, payload: JobPayload) -> Job {
        let job = self.store.insert(payload);
        if let Err(e) = self.queue.push(job.id) {
            tracing::error!(job_id = job.id, error = %e, "Failed to queue job");
        }
        metrics::counter!("generation_jobs_total").increment(1);
        metrics::gauge!("generation_queue_depth").set(self.queue.depth() as f64);
        tracing::info!(job_id = job.id, media_type = %job.payload.media_type, "Job queued");
        job
    }

    pub fn add_jobs(&self, payloads: impl IntoIterator<Item = JobPayload>) -> Vec<Job> {
        payloads.into_iter().map(|p| self.add_job(p)).collect()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bind workers to authenticated profiles and spawn them.
    ///
    /// Returns the number of workers started: `min(requested, authenticated)`.
    /// Calling it while workers are alive changes nothing and reports
    /// [`PoolError::AlreadyRunning`].
    pub fn start(&mut self) -> Result<usize, PoolError> {
        self.handles.retain(|handle| !handle.is_finished());
        if self.running.load(Ordering::Acquire) || !self.handles.is_empty() {
            tracing::warn!("Worker pool already running");
            return Err(PoolError::AlreadyRunning);
        }

        let authenticated = lock(&self.registry).authenticated_profiles();
        if authenticated.is_empty() {
            return Err(PoolError::NoAuthenticatedProfiles);
        }
        let bindings = assign_profiles(&authenticated, self.settings.requested_threads);

        let stale = self.queue.clear_shutdown();
        if stale > 0 {
            tracing::debug!(stale, "Dropped leftover termination signals");
        }

        // A fresh flag per run so stragglers from a previous run never see it flip back.
        self.running = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            queue: self.queue.clone(),
            registry: Arc::clone(&self.registry),
            factory: Arc::clone(&self.factory),
            pipeline: self.pipeline.clone(),
            clock: Arc::clone(&self.clock),
            observer: self.observer.clone(),
            running: Arc::clone(&self.running),
            inter_job_delay: self.settings.inter_job_delay,
            queue_poll: self.settings.queue_poll,
        });

        for binding in &bindings {
            let worker = Worker::new(
                binding.clone(),
                Arc::clone(&ctx),
                self.reporter.for_worker(binding.worker_id),
                exit_tx.clone(),
            );
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", binding.worker_id))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    let _ = self.queue.push_shutdown(self.handles.len());
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        self.exited = Some(exit_rx);
        self.bindings = bindings;
        self.reporter.info(&format!(
            "Started {} worker(s) ({} requested, {} authenticated profile(s))",
            self.bindings.len(),
            self.settings.requested_threads,
            authenticated.len()
        ));
        Ok(self.bindings.len())
    }

    /// Ask every worker to exit once its current job finishes. Nothing else
    /// is started after this call. With `wait`, block until the workers exit
    /// or the grace period elapses, then cancel every job still Pending.
    ///
    /// A waiting call after an earlier non-waiting one still waits for the
    /// workers that call signalled.
    pub fn stop(&mut self, wait: bool) {
        let workers = self.handles.len();
        if self.running.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.queue.push_shutdown(workers) {
                tracing::error!(error = %e, "Failed to signal workers");
            }
            self.reporter.info(&format!("Stopping {workers} worker(s)"));
        }
        if !wait || workers == 0 {
            return;
        }

        let exited = self.await_exit(workers, self.settings.stop_grace);
        if exited == workers {
            for handle in self.handles.drain(..) {
                if handle.join().is_err() {
                    tracing::error!("Worker thread panicked outside a job");
                }
            }
        } else {
            self.reporter.warn(&format!(
                "{} worker(s) still busy after {}s grace period",
                workers - exited,
                self.settings.stop_grace.as_secs()
            ));
        }

        let cancelled = self.cancel_pending();
        if cancelled > 0 {
            self.reporter
                .info(&format!("Cancelled {cancelled} job(s) left in the queue"));
        }
        self.reporter.info("Worker pool stopped");
    }

    /// Cancel everything queued, then stop.
    pub fn shutdown_now(&mut self, wait: bool) {
        self.cancel_pending();
        self.stop(wait);
    }

    /// Cancel every Pending job and empty the queue. Running jobs are untouched.
    pub fn cancel_pending(&self) -> usize {
        let drained = self.queue.drain_jobs();
        let cancelled = self.store.cancel_pending("cancelled before start");
        for job in &cancelled {
            if let Some(observer) = &self.observer {
                observer.job_finished(job);
            }
        }
        metrics::counter!("generation_jobs_cancelled").increment(cancelled.len() as u64);
        metrics::gauge!("generation_queue_depth").set(self.queue.depth() as f64);
        tracing::info!(drained = drained.len(), cancelled = cancelled.len(), "Pending jobs cancelled");
        cancelled.len()
    }

    /// Stop, then forget every job and restart ids at 1.
    pub fn reset(&mut self) {
        self.stop(true);
        self.queue.drain_jobs();
        self.store.clear();
        self.bindings.clear();
    }

    fn await_exit(&self, workers: usize, grace: Duration) -> usize {
        let Some(exited) = &self.exited else {
            return workers;
        };
        let deadline = Instant::now() + grace;
        let mut count = 0;
        while count < workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match exited.recv_timeout(remaining) {
                Ok(worker_id) => {
                    tracing::debug!(worker_id, "Worker exited");
                    count += 1;
                }
                Err(_) => break,
            }
        }
        count
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.store.get(id)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.store.all()
    }

    pub fn counts(&self) -> JobCounts {
        self.store.counts()
    }

    /// Nothing Pending and nothing Running.
    pub fn is_idle(&self) -> bool {
        let counts = self.counts();
        counts.pending == 0 && counts.running == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Worker→profile bindings of the current (or last) run.
    pub fn bindings(&self) -> &[WorkerBinding] {
        &self.bindings
    }

    pub fn worker_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop(false);
        }
    }
}

fn lock(registry: &Mutex<ProfileRegistry>) -> MutexGuard<'_, ProfileRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Signals the pool when a worker thread ends, however it ends.
struct ExitSignal {
    worker_id: usize,
    tx: Sender<usize>,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.tx.send(self.worker_id);
    }
}

struct Worker {
    binding: WorkerBinding,
    ctx: Arc<WorkerContext>,
    reporter: WorkerReporter,
    pipeline: GenerationPipeline,
    driver: Option<Box<dyn AutomationDriver>>,
    _exit: ExitSignal,
}

impl Worker {
    fn new(
        binding: WorkerBinding,
        ctx: Arc<WorkerContext>,
        reporter: WorkerReporter,
        exit_tx: Sender<usize>,
    ) -> Self {
        let pipeline = GenerationPipeline::new(ctx.pipeline.clone(), Arc::clone(&ctx.clock));
        Self {
            _exit: ExitSignal {
                worker_id: binding.worker_id,
                tx: exit_tx,
            },
            binding,
            ctx,
            reporter,
            pipeline,
            driver: None,
        }
    }

    fn run(mut self) {
        self.reporter
            .info(&format!("Started with profile {}", self.binding.profile.name));
        // Queued jobs are left Pending once the flag drops; `stop` cancels them.
        while self.is_running() {
            match self.ctx.queue.pop(self.ctx.queue_poll) {
                Ok(Popped::Job(id)) => {
                    if self.process(id) && self.is_running() {
                        self.ctx.clock.sleep(self.ctx.inter_job_delay);
                    }
                }
                Ok(Popped::Shutdown) => break,
                Ok(Popped::Empty) => {}
                Err(e) => {
                    self.reporter.error(&format!("Queue unavailable: {e}"));
                    break;
                }
            }
        }
        self.driver = None;
        self.reporter.info("Stopped");
    }

    fn is_running(&self) -> bool {
        self.ctx.running.load(Ordering::Acquire)
    }

    /// Run one job. Returns false when the job was skipped because it is no
    /// longer Pending.
    fn process(&mut self, id: JobId) -> bool {
        let Some(job) = self.ctx.store.start(id, self.binding.worker_id) else {
            tracing::debug!(job_id = id, "Skipping job that is no longer pending");
            return false;
        };
        if let Some(observer) = &self.ctx.observer {
            observer.job_started(&job);
        }
        metrics::gauge!("generation_queue_depth").set(self.ctx.queue.depth() as f64);
        self.reporter.info(&format!("Job #{id} started"));

        let started = self.ctx.clock.now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job)))
            .unwrap_or_else(|payload| {
                Err(PipelineError::Unclassified(format!(
                    "panic: {}",
                    panic_message(payload.as_ref())
                )))
            });
        let elapsed = self.ctx.clock.now().saturating_sub(started);
        metrics::histogram!("generation_job_seconds").record(elapsed.as_secs_f64());

        let finished = match result {
            Ok(outcome) => {
                if self.pipeline.session_lost() {
                    self.discard_driver("session lost during retrieval");
                }
                self.reporter.info(&format!(
                    "Job #{id} completed: {}/{} variation(s) saved",
                    outcome.artifacts.len(),
                    outcome.requested()
                ));
                metrics::counter!("generation_jobs_completed").increment(1);
                self.ctx.store.complete(id, outcome)
            }
            Err(e) => {
                self.handle_failure(&e);
                self.reporter.error(&format!("Job #{id} failed: {e}"));
                metrics::counter!("generation_jobs_failed", "kind" => e.kind()).increment(1);
                self.ctx.store.fail(id, e.to_string())
            }
        };

        if let Err(e) = lock(&self.ctx.registry).mark_used(&self.binding.profile.name) {
            tracing::warn!(profile = %self.binding.profile.name, error = %e, "Failed to record profile use");
        }
        if let (Some(observer), Some(job)) = (&self.ctx.observer, finished.as_ref()) {
            observer.job_finished(job);
        }
        true
    }

    fn execute(&mut self, job: &Job) -> Result<GenerationOutcome, PipelineError> {
        let driver = match self.driver.take() {
            Some(driver) => driver,
            None => {
                let driver = self.ctx.factory.connect(&self.binding.profile).map_err(|source| {
                    PipelineError::Driver {
                        stage: PipelineState::Init,
                        source,
                    }
                })?;
                self.pipeline.invalidate_settings();
                tracing::info!(
                    worker_id = self.binding.worker_id,
                    profile = %self.binding.profile.name,
                    "Driver connected"
                );
                driver
            }
        };
        let driver = self.driver.insert(driver);
        self.pipeline.run(&mut **driver, job, &self.reporter)
    }

    fn handle_failure(&mut self, error: &PipelineError) {
        match error {
            PipelineError::Authentication { .. } => {
                let mut registry = lock(&self.ctx.registry);
                if let Err(e) =
                    registry.mark_needs_reauth(&self.binding.profile.name, &error.to_string())
                {
                    tracing::warn!(error = %e, "Failed to record profile status");
                }
                self.reporter.warn(&format!(
                    "Profile {} needs re-authentication",
                    self.binding.profile.name
                ));
            }
            PipelineError::Unclassified(_) => self.discard_driver("unclassified failure"),
            _ if error.is_session_fatal() || self.pipeline.session_lost() => {
                self.discard_driver("session error")
            }
            _ => {}
        }
    }

    fn discard_driver(&mut self, reason: &str) {
        if self.driver.take().is_some() {
            self.pipeline.invalidate_settings();
            self.reporter
                .warn(&format!("Discarding driver ({reason}), reconnecting for the next job"));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No authenticated profiles available")]
    NoAuthenticatedProfiles,

    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Profile registry error: {0}")]
    Registry(#[from] ProfileError),
}
