mod fixtures;
mod helpers;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use media_batch::models::job::JobStatus;
use media_batch::models::profile::ProfileStatus;
use media_batch::services::clock::ManualClock;
use media_batch::services::data_source::{DataSource, DataSourceObserver, ManifestSource};
use media_batch::services::profiles::ProfileRegistry;
use media_batch::services::reporter::Reporter;
use media_batch::services::scheduler::{PoolError, WorkerPool};

use fixtures::{authenticated_registry, pipeline_settings, pool_settings, video_payload, PROMPTS};
use helpers::{lock, wait_until, world, Behavior, FakeFactory, Gate, ProbeObserver, SharedWorld};

const PATIENCE: Duration = Duration::from_secs(10);

fn pool(
    dir: &Path,
    registry: Arc<Mutex<ProfileRegistry>>,
    factory: FakeFactory,
    threads: usize,
) -> WorkerPool {
    WorkerPool::new(
        registry,
        Arc::new(factory),
        pool_settings(threads),
        pipeline_settings(&dir.join("downloads")),
        Arc::new(ManualClock::new()),
        Reporter::silent(),
    )
}

/// Let the workers finish everything queued, then stop.
fn finish(pool: &mut WorkerPool) {
    assert!(wait_until(PATIENCE, || pool.is_idle()));
    pool.stop(true);
}

fn payloads(dir: &Path, count: usize) -> Vec<media_batch::models::job::JobPayload> {
    (0..count)
        .map(|i| video_payload(PROMPTS[i], &dir.join(format!("out/job_{i}.mp4"))))
        .collect()
}

#[test]
fn test_single_worker_runs_jobs_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let feed: SharedWorld = world();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let mut pool = pool(dir.path(), registry, FakeFactory::new(Arc::clone(&feed), Behavior::default()), 1);

    let jobs = pool.add_jobs(payloads(dir.path(), 3));
    assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(pool.start().unwrap(), 1);
    finish(&mut pool);

    let counts = pool.counts();
    assert_eq!(counts.completed + counts.failed, 3);
    assert_eq!(counts.completed, 3);
    assert_eq!(lock(&feed).submitted, PROMPTS[..3].to_vec());

    for job in pool.jobs() {
        assert_eq!(job.assigned_worker, Some(1));
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert!(job.status.is_terminal());
    }
    assert!(pool.is_idle());
}

#[test]
fn test_concurrency_never_exceeds_profile_count() {
    let dir = tempfile::tempdir().unwrap();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1", "P2"]);
    let mut pool = pool(dir.path(), registry, FakeFactory::new(world(), Behavior::default()), 4);
    let probe = Arc::new(ProbeObserver::default());
    pool.set_observer(probe.clone());

    pool.add_jobs(payloads(dir.path(), 5));
    assert_eq!(pool.start().unwrap(), 2);
    assert!(wait_until(PATIENCE, || pool.is_idle()));
    pool.stop(true);

    assert!(probe.peak() <= 2);
    assert_eq!(probe.finished_count(), 5);
    assert_eq!(pool.counts().completed, 5);

    let bound: Vec<_> = pool.bindings().iter().map(|b| b.profile.name.clone()).collect();
    assert_eq!(bound, vec!["P1", "P2"]);
}

#[test]
fn test_requested_threads_cap_worker_count() {
    let dir = tempfile::tempdir().unwrap();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1", "P2", "P3"]);
    let mut pool = pool(dir.path(), registry, FakeFactory::new(world(), Behavior::default()), 2);

    assert_eq!(pool.start().unwrap(), 2);
    assert_eq!(pool.worker_count(), 2);
    assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));
    pool.stop(true);
}

#[test]
fn test_pool_cannot_start_without_authenticated_profiles() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("profiles");
    let registry = {
        let mut registry = ProfileRegistry::open(&root).unwrap();
        registry.create_profile("P1").unwrap();
        Arc::new(Mutex::new(registry))
    };
    let mut pool = pool(dir.path(), registry, FakeFactory::new(world(), Behavior::default()), 2);
    pool.add_job(video_payload(PROMPTS[0], &dir.path().join("a.mp4")));

    assert!(matches!(pool.start(), Err(PoolError::NoAuthenticatedProfiles)));
    assert!(!pool.is_running());
    assert_eq!(pool.counts().pending, 1);
}

#[test]
fn test_cancel_pending_leaves_running_job_alone() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Gate::default();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let factory = FakeFactory::new(world(), Behavior::default()).with_gate(gate.clone());
    let mut pool = pool(dir.path(), registry, factory, 1);

    pool.add_jobs(payloads(dir.path(), 3));
    pool.start().unwrap();
    assert!(wait_until(PATIENCE, || pool.counts().running == 1));

    assert_eq!(pool.cancel_pending(), 2);
    let counts = pool.counts();
    assert_eq!(counts.running, 1);
    assert_eq!(counts.cancelled, 2);
    assert_eq!(pool.job(2).unwrap().status, JobStatus::Cancelled);
    assert_eq!(pool.job(3).unwrap().status, JobStatus::Cancelled);

    gate.open();
    pool.stop(true);
    assert_eq!(pool.job(1).unwrap().status, JobStatus::Completed);
    assert_eq!(pool.counts().cancelled, 2);
}

#[test]
fn test_failing_job_does_not_stop_worker() {
    let dir = tempfile::tempdir().unwrap();
    let feed = world();
    lock(&feed).panics_left = 1;
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let mut pool = pool(dir.path(), registry, FakeFactory::new(Arc::clone(&feed), Behavior::default()), 1);

    pool.add_jobs(payloads(dir.path(), 2));
    pool.start().unwrap();
    finish(&mut pool);

    let first = pool.job(1).unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert!(first.error.unwrap().contains("driver crashed"));
    assert_eq!(pool.job(2).unwrap().status, JobStatus::Completed);
    // The panicking session was discarded and a fresh one connected.
    assert_eq!(lock(&feed).connects, vec!["P1", "P1"]);
}

#[test]
fn test_unauthenticated_session_flags_profile() {
    let dir = tempfile::tempdir().unwrap();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let behavior = Behavior {
        authenticated: false,
        ..Behavior::default()
    };
    let mut pool = pool(dir.path(), Arc::clone(&registry), FakeFactory::new(world(), behavior), 1);

    pool.add_job(video_payload(PROMPTS[0], &dir.path().join("a.mp4")));
    pool.start().unwrap();
    finish(&mut pool);

    let job = pool.job(1).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("not authenticated"));

    let registry = registry.lock().unwrap();
    let profile = registry.get("P1").unwrap();
    assert_eq!(profile.status, ProfileStatus::NeedsReauth);
    assert!(profile.last_used.is_some());
}

#[test]
fn test_every_job_is_terminal_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1", "P2"]);
    let mut pool = pool(dir.path(), registry, FakeFactory::new(world(), Behavior::default()), 2);

    pool.add_jobs(payloads(dir.path(), 5));
    pool.start().unwrap();
    pool.stop(true);

    let counts = pool.counts();
    assert_eq!(counts.pending + counts.running, 0);
    assert_eq!(counts.total(), 5);
    assert!(pool.jobs().iter().all(|job| job.status.is_terminal()));
}

#[test]
fn test_stop_starts_no_further_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let feed = world();
    let gate = Gate::default();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let factory = FakeFactory::new(Arc::clone(&feed), Behavior::default()).with_gate(gate.clone());
    let mut pool = pool(dir.path(), registry, factory, 1);

    pool.add_jobs(payloads(dir.path(), 3));
    pool.start().unwrap();
    assert!(wait_until(PATIENCE, || pool.counts().running == 1));

    pool.stop(false);
    assert!(!pool.is_running());
    gate.open();
    assert!(wait_until(PATIENCE, || pool.counts().running == 0));
    // Give the worker a chance to pick up more work if it were going to.
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(pool.job(1).unwrap().status, JobStatus::Completed);
    for id in [2, 3] {
        let job = pool.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
    }
    assert_eq!(lock(&feed).submitted, vec![PROMPTS[0].to_string()]);

    pool.stop(true);
    assert_eq!(pool.job(2).unwrap().status, JobStatus::Cancelled);
    assert_eq!(pool.job(3).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn test_shutdown_now_cancels_queue_first() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Gate::default();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let factory = FakeFactory::new(world(), Behavior::default()).with_gate(gate.clone());
    let mut pool = pool(dir.path(), registry, factory, 1);

    pool.add_jobs(payloads(dir.path(), 4));
    pool.start().unwrap();
    assert!(wait_until(PATIENCE, || pool.counts().running == 1));

    pool.shutdown_now(false);
    assert_eq!(pool.counts().cancelled, 3);

    gate.open();
    pool.stop(true);
    assert!(pool.jobs().iter().all(|job| job.status.is_terminal()));

    let counts = pool.counts();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.cancelled, 3);
}

#[test]
fn test_restart_after_stop_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let mut pool = pool(dir.path(), registry, FakeFactory::new(world(), Behavior::default()), 1);

    pool.add_job(video_payload(PROMPTS[0], &dir.path().join("a.mp4")));
    pool.start().unwrap();
    finish(&mut pool);
    assert!(!pool.is_running());

    pool.add_job(video_payload(PROMPTS[1], &dir.path().join("b.mp4")));
    pool.start().unwrap();
    finish(&mut pool);
    assert_eq!(pool.counts().completed, 2);

    pool.reset();
    assert_eq!(pool.counts().total(), 0);
    assert_eq!(pool.add_job(video_payload(PROMPTS[2], &dir.path().join("c.mp4"))).id, 1);
}

#[test]
fn test_manifest_rows_receive_final_status() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("jobs.json");
    let rows = serde_json::json!([
        {"stt": 1, "prompt": PROMPTS[0], "save_name": "lighthouse"},
        {"stt": 2, "prompt": PROMPTS[1], "status": "done"},
        {"stt": 3, "prompt": PROMPTS[2]}
    ]);
    std::fs::write(&manifest, rows.to_string()).unwrap();
    let source = Arc::new(ManifestSource::open(&manifest, dir.path(), dir.path().join("out")).unwrap());

    let registry = authenticated_registry(&dir.path().join("profiles"), &["P1"]);
    let mut pool = pool(dir.path(), registry, FakeFactory::new(world(), Behavior::default()), 1);
    pool.set_observer(Arc::new(DataSourceObserver::new(source.clone())));

    pool.add_jobs(source.load_jobs(true).unwrap());
    pool.start().unwrap();
    finish(&mut pool);

    assert!(dir.path().join("out/lighthouse.mp4").exists());
    assert!(dir.path().join("out/video_3.mp4").exists());

    let reread = ManifestSource::open(&manifest, dir.path(), dir.path()).unwrap();
    assert!(reread.load_jobs(true).unwrap().is_empty());
}
