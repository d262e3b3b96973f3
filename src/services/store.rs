use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::models::generation::GenerationOutcome;
use crate::models::job::{Job, JobCounts, JobId, JobPayload, JobStatus};

/// In-memory registry of every submitted job.
///
/// One mutex guards the id counter and the job map. Callers only ever get
/// cloned snapshots; mutation goes through the transition methods below,
/// which refuse to touch a job once it is terminal.
#[derive(Debug, Default)]
pub struct JobStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
}

impl Default for StoreInner {
    fn default() -> Self {
        Self {
            next_id: 1,
            jobs: BTreeMap::new(),
        }
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a Pending job with the next id.
    pub fn insert(&self, payload: JobPayload) -> Job {
        let mut inner = self.lock();
        let job = Job::new(inner.next_id, payload);
        inner.next_id += 1;
        inner.jobs.insert(job.id, job.clone());
        job
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Snapshots of all jobs in id (submission) order.
    pub fn all(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Pending → Running. Returns the started job, or `None` if the job is
    /// unknown or no longer Pending (e.g. cancelled after it was queued).
    pub fn start(&self, id: JobId, worker_id: usize) -> Option<Job> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id)?;
        if job.status != JobStatus::Pending {
            return None;
        }
        job.status = JobStatus::Running;
        job.assigned_worker = Some(worker_id);
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    /// Running → Completed.
    pub fn complete(&self, id: JobId, outcome: GenerationOutcome) -> Option<Job> {
        self.finish(id, JobStatus::Completed, Some(outcome), None)
    }

    /// Running/Pending → Failed with a reason.
    pub fn fail(&self, id: JobId, error: impl Into<String>) -> Option<Job> {
        self.finish(id, JobStatus::Failed, None, Some(error.into()))
    }

    fn finish(
        &self,
        id: JobId,
        status: JobStatus,
        result: Option<GenerationOutcome>,
        error: Option<String>,
    ) -> Option<Job> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id)?;
        if job.status.is_terminal() {
            tracing::warn!(job_id = id, status = %job.status, "Ignoring update to finished job");
            return None;
        }
        job.status = status;
        job.result = result;
        job.error = error;
        job.completed_at = Some(Utc::now());
        Some(job.clone())
    }

    /// Cancel every Pending job. Running jobs are untouched.
    pub fn cancel_pending(&self, reason: &str) -> Vec<Job> {
        let mut inner = self.lock();
        let now = Utc::now();
        inner
            .jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| {
                job.status = JobStatus::Cancelled;
                job.error = Some(reason.to_string());
                job.completed_at = Some(now);
                job.clone()
            })
            .collect()
    }

    pub fn counts(&self) -> JobCounts {
        let inner = self.lock();
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Drop every job and restart ids at 1.
    pub fn clear(&self) {
        *self.lock() = StoreInner::default();
    }
}
