//! Scripted automation driver and pool probes for integration testing

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use media_batch::models::generation::{shows_progress_marker, text_matches_prompt, FeedItem, Setting};
use media_batch::models::job::Job;
use media_batch::models::profile::Profile;
use media_batch::services::driver::{AutomationDriver, DriverError, DriverFactory, RetrievedArtifact};
use media_batch::services::scheduler::JobObserver;

use crate::fixtures::ARTIFACT_BYTES;

/// How fake sessions behave.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub authenticated: bool,
    /// Feed refreshes before a submitted item turns ready. `u32::MAX` never does.
    pub ready_after: u32,
    pub artifact_bytes: usize,
    /// Per-variation sizes in retrieval order; later variations fall back to
    /// `artifact_bytes`.
    pub artifact_sizes: Vec<usize>,
    /// Size the fake reports for each artifact, defaults to the bytes written.
    pub declared_size: Option<u64>,
    /// Submitted items show a generation error.
    pub fail_generation: bool,
    /// Number of `navigate_to_entry` calls that fail with ElementNotFound first.
    pub flaky_navigations: u32,
    /// `upload_references` fails with ElementNotFound.
    pub upload_fails: bool,
    /// Number of `set_prompt_text` calls that fail with ElementNotFound first.
    pub flaky_prompts: u32,
    /// The submit control is never found.
    pub submit_missing: bool,
    /// Submissions produce this many items regardless of the requested variations.
    pub produce: Option<usize>,
    /// Unread notifications reported while anything is in progress.
    pub notifications: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            authenticated: true,
            ready_after: 1,
            artifact_bytes: ARTIFACT_BYTES,
            artifact_sizes: Vec::new(),
            declared_size: None,
            fail_generation: false,
            flaky_navigations: 0,
            upload_fails: false,
            flaky_prompts: 0,
            submit_missing: false,
            produce: None,
            notifications: false,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeItem {
    id: String,
    prompt: String,
    remaining: u32,
    failed: bool,
}

impl FakeItem {
    /// Status line the tile shows under the prompt.
    fn status_text(&self) -> String {
        if self.failed {
            "Generation failed".to_string()
        } else if self.remaining > 0 {
            format!("Generating {}%", 100 / (self.remaining.saturating_add(1)))
        } else {
            "Ready".to_string()
        }
    }
}

/// The shared feed every fake session sees, plus a log of what drivers did.
#[derive(Debug, Default)]
pub struct FeedWorld {
    next_id: u64,
    items: Vec<FakeItem>,
    pub submitted: Vec<String>,
    pub applied: Vec<Setting>,
    pub uploads: Vec<PathBuf>,
    pub connects: Vec<String>,
    pub refreshes: usize,
    pub panics_left: usize,
}

impl FeedWorld {
    fn add(&mut self, prompt: &str, remaining: u32, failed: bool) -> String {
        self.next_id += 1;
        let id = format!("gen_{:04}", self.next_id);
        self.items.push(FakeItem {
            id: id.clone(),
            prompt: prompt.to_string(),
            remaining,
            failed,
        });
        id
    }

    /// Put an already finished item in the feed, as if produced before the test.
    pub fn seed_ready(&mut self, prompt: &str) -> String {
        self.add(prompt, 0, false)
    }

    pub fn seed_failed(&mut self, prompt: &str) -> String {
        self.add(prompt, 0, true)
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

pub type SharedWorld = Arc<Mutex<FeedWorld>>;

pub fn world() -> SharedWorld {
    Arc::new(Mutex::new(FeedWorld::default()))
}

pub fn lock(world: &SharedWorld) -> MutexGuard<'_, FeedWorld> {
    world.lock().unwrap()
}

/// Manually opened latch that holds `submit` calls.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, cvar) = &*self.inner;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (open, cvar) = &*self.inner;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = cvar.wait(guard).unwrap();
        }
    }
}

pub struct FakeDriver {
    profile: String,
    world: SharedWorld,
    behavior: Behavior,
    gate: Option<Gate>,
    prompt: String,
    variations: u8,
    navigations: u32,
    prompt_attempts: u32,
    retrievals: usize,
}

impl FakeDriver {
    pub fn new(profile: &str, world: SharedWorld, behavior: Behavior) -> Self {
        Self {
            profile: profile.to_string(),
            world,
            behavior,
            gate: None,
            prompt: String::new(),
            variations: 1,
            navigations: 0,
            prompt_attempts: 0,
            retrievals: 0,
        }
    }
}

impl AutomationDriver for FakeDriver {
    fn profile(&self) -> &str {
        &self.profile
    }

    fn is_authenticated(&mut self) -> Result<bool, DriverError> {
        Ok(self.behavior.authenticated)
    }

    fn navigate_to_entry(&mut self) -> Result<(), DriverError> {
        self.navigations += 1;
        if self.navigations <= self.behavior.flaky_navigations {
            return Err(DriverError::ElementNotFound("prompt box".into()));
        }
        Ok(())
    }

    fn apply_setting(&mut self, setting: &Setting) -> Result<(), DriverError> {
        if let Setting::Variations(count) = setting {
            self.variations = *count;
        }
        lock(&self.world).applied.push(setting.clone());
        Ok(())
    }

    fn upload_references(&mut self, paths: &[PathBuf]) -> Result<(), DriverError> {
        if self.behavior.upload_fails {
            return Err(DriverError::ElementNotFound("file input".into()));
        }
        lock(&self.world).uploads.extend(paths.iter().cloned());
        Ok(())
    }

    fn set_prompt_text(&mut self, text: &str) -> Result<(), DriverError> {
        self.prompt_attempts += 1;
        if self.prompt_attempts <= self.behavior.flaky_prompts {
            return Err(DriverError::ElementNotFound("prompt box".into()));
        }
        self.prompt = text.to_string();
        Ok(())
    }

    fn submit(&mut self) -> Result<(), DriverError> {
        if self.behavior.submit_missing {
            return Err(DriverError::ElementNotFound("submit button".into()));
        }
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        let mut world = lock(&self.world);
        if world.panics_left > 0 {
            world.panics_left -= 1;
            drop(world);
            panic!("driver crashed while submitting");
        }
        world.submitted.push(self.prompt.clone());
        let count = self.behavior.produce.unwrap_or(usize::from(self.variations));
        for _ in 0..count {
            let prompt = self.prompt.clone();
            world.add(&prompt, self.behavior.ready_after, self.behavior.fail_generation);
        }
        Ok(())
    }

    fn snapshot_feed_ids(&mut self) -> Result<HashSet<String>, DriverError> {
        Ok(lock(&self.world).item_ids().into_iter().collect())
    }

    fn refresh_feed(&mut self) -> Result<(), DriverError> {
        let mut world = lock(&self.world);
        world.refreshes += 1;
        for item in world.items.iter_mut() {
            item.remaining = item.remaining.saturating_sub(1);
        }
        Ok(())
    }

    fn notification_count(&mut self) -> Result<u32, DriverError> {
        if !self.behavior.notifications {
            return Ok(0);
        }
        let world = lock(&self.world);
        Ok(world.items.iter().filter(|item| item.remaining <= 1).count() as u32)
    }

    fn find_matching_feed_items(&mut self, prompt_prefix: &str) -> Result<Vec<FeedItem>, DriverError> {
        let world = lock(&self.world);
        Ok(world
            .items
            .iter()
            .rev()
            .filter(|item| text_matches_prompt(&item.prompt, prompt_prefix))
            .map(|item| FeedItem {
                id: item.id.clone(),
                ready: !item.failed && !shows_progress_marker(&item.status_text()),
                failed: item.failed,
                declared_size: None,
            })
            .collect())
    }

    fn retrieve_artifact(
        &mut self,
        _item: &FeedItem,
        destination: &Path,
    ) -> Result<RetrievedArtifact, DriverError> {
        let bytes = self
            .behavior
            .artifact_sizes
            .get(self.retrievals)
            .copied()
            .unwrap_or(self.behavior.artifact_bytes);
        self.retrievals += 1;
        std::fs::write(destination, vec![7u8; bytes])?;
        Ok(RetrievedArtifact {
            declared_size: Some(self.behavior.declared_size.unwrap_or(bytes as u64)),
        })
    }
}

/// Builds a [`FakeDriver`] per profile, all sharing one feed.
pub struct FakeFactory {
    pub world: SharedWorld,
    pub behavior: Behavior,
    pub gate: Option<Gate>,
}

impl FakeFactory {
    pub fn new(world: SharedWorld, behavior: Behavior) -> Self {
        Self {
            world,
            behavior,
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl DriverFactory for FakeFactory {
    fn connect(&self, profile: &Profile) -> Result<Box<dyn AutomationDriver>, DriverError> {
        lock(&self.world).connects.push(profile.name.clone());
        let mut driver = FakeDriver::new(&profile.name, Arc::clone(&self.world), self.behavior.clone());
        driver.gate = self.gate.clone();
        Ok(Box::new(driver))
    }
}

/// Records job starts and finishes and the peak number running at once.
#[derive(Debug, Default)]
pub struct ProbeObserver {
    running: AtomicUsize,
    pub peak: AtomicUsize,
    pub started: Mutex<Vec<u64>>,
    pub finished: Mutex<Vec<Job>>,
}

impl ProbeObserver {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started_ids(&self) -> Vec<u64> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().unwrap().len()
    }
}

impl JobObserver for ProbeObserver {
    fn job_started(&self, job: &Job) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(job.id);
        // Hold the slot briefly so overlapping workers are observable.
        std::thread::sleep(Duration::from_millis(5));
    }

    fn job_finished(&self, job: &Job) {
        if job.started_at.is_some() {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
        self.finished.lock().unwrap().push(job.clone());
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
