use std::fmt;
use std::sync::Arc;

/// Single-argument hook receiving human-readable progress lines.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Fans progress messages out to `tracing` and an optional [`LogSink`].
///
/// Worker-scoped messages are prefixed with `[Worker #n]` before reaching the
/// sink; the tracing event carries the worker id as a field instead.
#[derive(Clone, Default)]
pub struct Reporter {
    sink: Option<LogSink>,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Reporter {
    pub fn new(sink: LogSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// Reporter that only emits tracing events.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{message}");
        self.forward(message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!("{message}");
        self.forward(message);
    }

    /// Scope messages to one worker.
    pub fn for_worker(&self, worker_id: usize) -> WorkerReporter {
        WorkerReporter {
            inner: self.clone(),
            worker_id,
        }
    }

    fn forward(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink(message);
        }
    }
}

/// A [`Reporter`] bound to one worker id.
#[derive(Debug, Clone)]
pub struct WorkerReporter {
    inner: Reporter,
    worker_id: usize,
}

impl WorkerReporter {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn info(&self, message: &str) {
        tracing::info!(worker_id = self.worker_id, "{message}");
        self.inner.forward(&self.prefixed(message));
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(worker_id = self.worker_id, "{message}");
        self.inner.forward(&self.prefixed(message));
    }

    pub fn error(&self, message: &str) {
        tracing::error!(worker_id = self.worker_id, "{message}");
        self.inner.forward(&self.prefixed(message));
    }

    fn prefixed(&self, message: &str) -> String {
        format!("[Worker #{}] {}", self.worker_id, message)
    }
}
