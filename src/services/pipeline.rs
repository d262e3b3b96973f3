//! Per-job generation state machine.
//!
//! ```text
//! Init → Navigating → Configuring → Submitting → Waiting ⇄ Matching → Retrieving → Done
//!                                                    │
//!                                                    └──────────────→ Error (any stage)
//! ```
//!
//! The feed the pipeline polls is shared with every other worker and keeps
//! reordering, so results are recognised by identity, never by position: a
//! snapshot of feed ids is taken before submitting and only items absent from
//! it may be attributed to the job.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum::Display;

use crate::config::PipelineSettings;
use crate::models::generation::{
    GenerationAttempt, GenerationOutcome, GenerationSettings, Readiness, VariationFailure,
};
use crate::models::job::{Job, JobPayload};
use crate::services::clock::Clock;
use crate::services::driver::{AutomationDriver, DriverError};
use crate::services::reporter::WorkerReporter;
use crate::services::validation::{self, ArtifactRules};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineState {
    Init,
    Navigating,
    Configuring,
    Submitting,
    Waiting,
    Matching,
    Retrieving,
    Done,
    Error,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Error)
    }
}

/// Mutable state threaded through one run.
struct RunContext<'a> {
    job: &'a Job,
    attempt: GenerationAttempt,
    submitted_at: Duration,
    outcome: GenerationOutcome,
}

impl RunContext<'_> {
    fn payload(&self) -> &JobPayload {
        &self.job.payload
    }
}

/// Drives one worker's session through the generation stages.
///
/// One instance lives per worker, so the "last applied settings" cache is
/// scoped to that worker's session.
pub struct GenerationPipeline {
    settings: PipelineSettings,
    clock: Arc<dyn Clock>,
    last_applied: Option<GenerationSettings>,
    history: Vec<PipelineState>,
    session_lost: bool,
}

impl GenerationPipeline {
    pub fn new(settings: PipelineSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            last_applied: None,
            history: Vec::new(),
            session_lost: false,
        }
    }

    /// States visited by the most recent run, terminal state included.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Whether the most recent run saw the session die. The caller should
    /// rebuild its driver before the next job.
    pub fn session_lost(&self) -> bool {
        self.session_lost
    }

    /// Forget the cached settings, e.g. after the driver was rebuilt.
    pub fn invalidate_settings(&mut self) {
        self.last_applied = None;
    }

    pub fn last_applied(&self) -> Option<&GenerationSettings> {
        self.last_applied.as_ref()
    }

    /// Run `job` to completion on `driver`.
    pub fn run(
        &mut self,
        driver: &mut dyn AutomationDriver,
        job: &Job,
        reporter: &WorkerReporter,
    ) -> Result<GenerationOutcome, PipelineError> {
        self.history.clear();
        self.session_lost = false;

        let mut ctx = RunContext {
            job,
            attempt: GenerationAttempt::new(&job.payload, self.settings.prompt_match_chars),
            submitted_at: self.clock.now(),
            outcome: GenerationOutcome::default(),
        };
        let mut state = PipelineState::Init;
        let mut failure: Option<(PipelineState, PipelineError)> = None;

        loop {
            self.history.push(state);
            tracing::debug!(job_id = job.id, state = %state, "Pipeline transition");

            let next = match state {
                PipelineState::Init => self.check_session(driver, reporter),
                PipelineState::Navigating => self.navigate(driver, reporter),
                PipelineState::Configuring => self.configure(driver, ctx.payload(), reporter),
                PipelineState::Submitting => self.submit(driver, &mut ctx, reporter),
                PipelineState::Waiting => self.wait(driver, &ctx, reporter),
                PipelineState::Matching => self.match_feed(driver, &mut ctx, reporter),
                PipelineState::Retrieving => self.retrieve(driver, &mut ctx, reporter),
                PipelineState::Done => {
                    let outcome = std::mem::take(&mut ctx.outcome);
                    return if outcome.is_success() {
                        Ok(outcome)
                    } else {
                        Err(PipelineError::NoArtifacts {
                            requested: outcome.requested(),
                            failures: outcome.failures,
                        })
                    };
                }
                PipelineState::Error => {
                    let (failed_in, error) = failure.take().unwrap_or_else(|| {
                        (
                            state,
                            PipelineError::Unclassified("error state entered without a cause".into()),
                        )
                    });
                    if error.is_session_fatal() {
                        self.session_lost = true;
                    }
                    tracing::warn!(job_id = job.id, state = %failed_in, error = %error, "Pipeline failed");
                    return Err(error);
                }
            };

            state = match next {
                Ok(next) => next,
                Err(e) => {
                    failure = Some((state, e));
                    PipelineState::Error
                }
            };
        }
    }

    // ── Init ─────────────────────────────────────────────────────────

    fn check_session(
        &self,
        driver: &mut dyn AutomationDriver,
        reporter: &WorkerReporter,
    ) -> Result<PipelineState, PipelineError> {
        let authenticated =
            self.with_retries(PipelineState::Init, reporter, || driver.is_authenticated())?;
        if !authenticated {
            return Err(PipelineError::Authentication {
                profile: driver.profile().to_string(),
            });
        }
        Ok(PipelineState::Navigating)
    }

    // ── Navigating ───────────────────────────────────────────────────

    fn navigate(
        &self,
        driver: &mut dyn AutomationDriver,
        reporter: &WorkerReporter,
    ) -> Result<PipelineState, PipelineError> {
        self.with_retries(PipelineState::Navigating, reporter, || driver.navigate_to_entry())?;
        Ok(PipelineState::Configuring)
    }

    // ── Configuring ──────────────────────────────────────────────────

    fn configure(
        &mut self,
        driver: &mut dyn AutomationDriver,
        payload: &JobPayload,
        reporter: &WorkerReporter,
    ) -> Result<PipelineState, PipelineError> {
        let wanted = GenerationSettings::from_payload(payload);
        let changes = wanted.changes_since(self.last_applied.as_ref());
        if changes.is_empty() {
            tracing::debug!("Settings unchanged since previous job, skipping configuration");
            return Ok(PipelineState::Submitting);
        }

        // Until every change lands the session is in an unknown configuration.
        self.last_applied = None;
        for setting in &changes {
            self.with_retries(PipelineState::Configuring, reporter, || {
                driver.apply_setting(setting)
            })?;
            tracing::debug!(setting = setting.label(), "Setting applied");
        }
        reporter.info(&format!("Applied {} setting(s)", changes.len()));
        self.last_applied = Some(wanted);
        Ok(PipelineState::Submitting)
    }

    // ── Submitting ───────────────────────────────────────────────────

    fn submit(
        &self,
        driver: &mut dyn AutomationDriver,
        ctx: &mut RunContext<'_>,
        reporter: &WorkerReporter,
    ) -> Result<PipelineState, PipelineError> {
        let prior = self.with_retries(PipelineState::Submitting, reporter, || {
            driver.snapshot_feed_ids()
        })?;
        tracing::debug!(job_id = ctx.job.id, prior = prior.len(), "Feed snapshot taken");
        ctx.attempt.set_prior(prior);

        let references: Vec<_> = ctx
            .payload()
            .reference_images
            .iter()
            .filter(|path| {
                let exists = path.exists();
                if !exists {
                    reporter.warn(&format!("Reference {} not found, skipping", path.display()));
                }
                exists
            })
            .cloned()
            .collect();
        if !references.is_empty() {
            match driver.upload_references(&references) {
                Ok(()) => reporter.info(&format!("Uploaded {} reference(s)", references.len())),
                Err(e) if e.is_session_fatal() => {
                    return Err(PipelineError::Driver {
                        stage: PipelineState::Submitting,
                        source: e,
                    })
                }
                Err(e) => reporter.warn(&format!("Reference upload failed, continuing without: {e}")),
            }
        }

        let prompt = ctx.payload().prompt.clone();
        self.with_retries(PipelineState::Submitting, reporter, || driver.set_prompt_text(&prompt))?;
        self.with_retries(PipelineState::Submitting, reporter, || driver.submit())?;

        ctx.submitted_at = self.clock.now();
        reporter.info(&format!("Submitted: {}", preview(&prompt)));
        Ok(PipelineState::Waiting)
    }

    // ── Waiting ──────────────────────────────────────────────────────

    fn wait(
        &self,
        driver: &mut dyn AutomationDriver,
        ctx: &RunContext<'_>,
        reporter: &WorkerReporter,
    ) -> Result<PipelineState, PipelineError> {
        let elapsed = self.clock.now().saturating_sub(ctx.submitted_at);
        if elapsed >= self.settings.wait_timeout {
            return Err(PipelineError::Timeout {
                waited: elapsed,
                matched: ctx.attempt.matched().len(),
                expected: ctx.attempt.expected_count,
            });
        }

        let interval = self
            .settings
            .refresh_interval
            .min(self.settings.wait_timeout - elapsed);
        let slice = self.settings.notification_poll.max(Duration::from_millis(1));
        let mut slept = Duration::ZERO;
        while slept < interval {
            let step = slice.min(interval - slept);
            self.clock.sleep(step);
            slept += step;
            if slept < interval && matches!(driver.notification_count(), Ok(n) if n > 0) {
                reporter.info("Notification indicator set, refreshing early");
                break;
            }
        }

        match driver.refresh_feed() {
            Ok(()) => {}
            Err(e) if e.is_session_fatal() => {
                return Err(PipelineError::Driver {
                    stage: PipelineState::Waiting,
                    source: e,
                })
            }
            Err(e) => reporter.warn(&format!("Feed refresh failed: {e}")),
        }
        Ok(PipelineState::Matching)
    }

    // ── Matching ─────────────────────────────────────────────────────

    fn match_feed(
        &self,
        driver: &mut dyn AutomationDriver,
        ctx: &mut RunContext<'_>,
        reporter: &WorkerReporter,
    ) -> Result<PipelineState, PipelineError> {
        let items = match driver.find_matching_feed_items(&ctx.attempt.prompt_fingerprint) {
            Ok(items) => items,
            Err(e) if e.is_session_fatal() => {
                return Err(PipelineError::Driver {
                    stage: PipelineState::Matching,
                    source: e,
                })
            }
            Err(e) => {
                reporter.warn(&format!("Feed enumeration failed: {e}"));
                return Ok(PipelineState::Waiting);
            }
        };

        let stale = items.iter().filter(|item| !ctx.attempt.is_fresh(&item.id)).count();
        let added = ctx.attempt.observe(&items);
        debug_assert!(ctx
            .attempt
            .matched()
            .iter()
            .all(|item| !ctx.attempt.prior_ids().contains(&item.id)));
        tracing::debug!(job_id = ctx.job.id, added, stale, "Feed observed");

        let waited = self.clock.now().saturating_sub(ctx.submitted_at).as_secs();
        match ctx.attempt.readiness() {
            Readiness::Ready => {
                reporter.info(&format!(
                    "{} result(s) ready after {waited}s",
                    ctx.attempt.expected_count
                ));
                Ok(PipelineState::Retrieving)
            }
            Readiness::FailedTask => {
                reporter.warn("Generation error shown for this prompt");
                Ok(PipelineState::Retrieving)
            }
            Readiness::NotReady { matched, in_progress } => {
                reporter.info(&format!(
                    "Waited {waited}s: {matched}/{} matched, {in_progress} in progress",
                    ctx.attempt.expected_count
                ));
                Ok(PipelineState::Waiting)
            }
        }
    }

    // ── Retrieving ───────────────────────────────────────────────────

    fn retrieve(
        &mut self,
        driver: &mut dyn AutomationDriver,
        ctx: &mut RunContext<'_>,
        reporter: &WorkerReporter,
    ) -> Result<PipelineState, PipelineError> {
        let rules = ArtifactRules {
            min_bytes: self.settings.min_artifact_bytes,
            size_tolerance: self.settings.size_tolerance_bytes,
        };
        let selected = ctx.attempt.selected().to_vec();
        let destinations =
            validation::variation_paths(ctx.payload(), ctx.job.id, &self.settings.download_dir);
        ctx.outcome.matched_ids = ctx.attempt.matched_ids();

        for (i, destination) in destinations.iter().enumerate() {
            let index = i + 1;
            let fail = |item_id: Option<&str>, reason: String| VariationFailure {
                index,
                item_id: item_id.map(str::to_string),
                reason,
            };

            let Some(item) = selected.get(i) else {
                ctx.outcome.failures.push(fail(None, "no matching feed item".into()));
                continue;
            };
            if self.session_lost {
                ctx.outcome.failures.push(fail(Some(&item.id), "session lost".into()));
                continue;
            }
            if item.failed {
                ctx.outcome.failures.push(fail(Some(&item.id), "generation failed".into()));
                continue;
            }
            if !item.ready {
                ctx.outcome.failures.push(fail(Some(&item.id), "still in progress".into()));
                continue;
            }

            if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = fs::create_dir_all(parent) {
                    ctx.outcome.failures.push(fail(Some(&item.id), e.to_string()));
                    continue;
                }
            }

            match driver.retrieve_artifact(item, destination) {
                Ok(artifact) => {
                    let declared = artifact.declared_size.or(item.declared_size);
                    match validation::validate_artifact(destination, declared, rules) {
                        Ok(size) => {
                            reporter.info(&format!(
                                "Saved variation {index} to {} ({size} bytes)",
                                destination.display()
                            ));
                            ctx.outcome.artifacts.push(destination.clone());
                        }
                        Err(e) => ctx.outcome.failures.push(fail(Some(&item.id), e.to_string())),
                    }
                }
                Err(e) => {
                    validation::discard(destination);
                    if e.is_session_fatal() {
                        self.session_lost = true;
                    }
                    reporter.warn(&format!("Variation {index} retrieval failed: {e}"));
                    ctx.outcome.failures.push(fail(Some(&item.id), e.to_string()));
                }
            }
        }

        Ok(PipelineState::Done)
    }

    // ── Retry policy ─────────────────────────────────────────────────

    /// Run a UI lookup, retrying transient failures with linear backoff.
    fn with_retries<T>(
        &self,
        stage: PipelineState,
        reporter: &WorkerReporter,
        mut op: impl FnMut() -> Result<T, DriverError>,
    ) -> Result<T, PipelineError> {
        let attempts = self.settings.stage_retries.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    reporter.warn(&format!("{stage} attempt {attempt}/{attempts} failed: {e}"));
                    self.clock.sleep(self.settings.retry_backoff * attempt);
                    attempt += 1;
                }
                Err(source) => return Err(PipelineError::Driver { stage, source }),
            }
        }
    }
}

fn preview(prompt: &str) -> String {
    let mut short: String = prompt.chars().take(50).collect();
    if prompt.chars().count() > 50 {
        short.push_str("...");
    }
    short
}

fn summarize(failures: &[VariationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("#{}: {}", f.index, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("profile {profile} is not authenticated")]
    Authentication { profile: String },

    #[error("{stage} failed: {source}")]
    Driver {
        stage: PipelineState,
        #[source]
        source: DriverError,
    },

    #[error("timed out after {}s waiting for {expected} result(s), {matched} matched", .waited.as_secs())]
    Timeout {
        waited: Duration,
        matched: usize,
        expected: usize,
    },

    #[error("no variation retrieved out of {requested}: {}", summarize(.failures))]
    NoArtifacts {
        requested: usize,
        failures: Vec<VariationFailure>,
    },

    #[error("unclassified error: {0}")]
    Unclassified(String),
}

impl PipelineError {
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, PipelineError::Driver { source, .. } if source.is_session_fatal())
    }

    /// Short machine-friendly classification used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Authentication { .. } => "authentication",
            PipelineError::Driver { .. } => "driver",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::NoArtifacts { .. } => "validation",
            PipelineError::Unclassified(_) => "unclassified",
        }
    }
}
