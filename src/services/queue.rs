use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::models::job::JobId;

/// Message carried by the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMessage {
    Job(JobId),
    /// Poison pill: the worker that pops it exits.
    Shutdown,
}

/// Result of a bounded pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Popped {
    Job(JobId),
    Shutdown,
    /// Nothing arrived within the timeout.
    Empty,
}

/// FIFO queue of job ids shared by every worker of a pool.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: Sender<QueueMessage>,
    rx: Receiver<QueueMessage>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Enqueue a job id behind everything already queued.
    pub fn push(&self, id: JobId) -> Result<(), QueueError> {
        self.tx
            .send(QueueMessage::Job(id))
            .map_err(|_| QueueError::Disconnected)
    }

    /// Enqueue one termination signal per worker.
    pub fn push_shutdown(&self, count: usize) -> Result<(), QueueError> {
        for _ in 0..count {
            self.tx
                .send(QueueMessage::Shutdown)
                .map_err(|_| QueueError::Disconnected)?;
        }
        Ok(())
    }

    /// Pop the next message, waiting at most `timeout`.
    pub fn pop(&self, timeout: Duration) -> Result<Popped, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(QueueMessage::Job(id)) => Ok(Popped::Job(id)),
            Ok(QueueMessage::Shutdown) => Ok(Popped::Shutdown),
            Err(RecvTimeoutError::Timeout) => Ok(Popped::Empty),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    /// Remove every queued job id, keeping termination signals in place.
    /// Returns the drained ids in FIFO order.
    pub fn drain_jobs(&self) -> Vec<JobId> {
        let mut drained = Vec::new();
        let mut pills = 0;
        for message in self.drain_all() {
            match message {
                QueueMessage::Job(id) => drained.push(id),
                QueueMessage::Shutdown => pills += 1,
            }
        }
        // Receiver and sender live in the same struct, so this cannot fail.
        let _ = self.push_shutdown(pills);
        drained
    }

    /// Remove leftover termination signals, keeping queued jobs in order.
    /// Returns how many signals were dropped.
    pub fn clear_shutdown(&self) -> usize {
        let messages = self.drain_all();
        let pills = messages.iter().filter(|m| **m == QueueMessage::Shutdown).count();
        for message in messages {
            if let QueueMessage::Job(id) = message {
                let _ = self.tx.send(QueueMessage::Job(id));
            }
        }
        pills
    }

    fn drain_all(&self) -> Vec<QueueMessage> {
        self.rx.try_iter().collect()
    }

    /// Number of queued messages, termination signals included.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue disconnected")]
    Disconnected,
}
