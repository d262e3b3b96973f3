use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

/// Environment prefix for every configuration variable.
const ENV_PREFIX: &str = "MEDIA_BATCH_";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Root directory holding one subdirectory of session storage per profile.
    #[serde(default = "default_profiles_dir")]
    #[garde(skip)]
    pub profiles_dir: PathBuf,

    /// Fallback directory for artifacts when a job carries no output target.
    #[serde(default = "default_download_dir")]
    #[garde(skip)]
    pub download_dir: PathBuf,

    /// Requested worker count. Capped by the number of authenticated profiles.
    #[serde(default = "default_max_threads")]
    #[garde(range(min = 1, max = 64))]
    pub max_threads: usize,

    /// Delay each worker sleeps after finishing a job.
    #[serde(default = "default_thread_delay_seconds")]
    #[garde(range(max = 600))]
    pub thread_delay_seconds: u64,

    /// Overall budget for the Waiting stage of one job.
    #[serde(default = "default_wait_timeout_seconds")]
    #[garde(range(min = 1))]
    pub wait_timeout_seconds: u64,

    /// Interval between feed refreshes while waiting.
    #[serde(default = "default_refresh_interval_seconds")]
    #[garde(range(min = 1))]
    pub refresh_interval_seconds: u64,

    /// Slice used to check the notification indicator inside a refresh interval.
    #[serde(default = "default_notification_poll_seconds")]
    #[garde(range(min = 1))]
    pub notification_poll_seconds: u64,

    /// Queue pop timeout, bounds how quickly a worker observes a stop request.
    #[serde(default = "default_queue_poll_millis")]
    #[garde(range(min = 10))]
    pub queue_poll_millis: u64,

    /// Attempts for UI lookups in the Navigating and Submitting stages.
    #[serde(default = "default_stage_retries")]
    #[garde(range(min = 1, max = 10))]
    pub stage_retries: u32,

    /// Base backoff between stage attempts (multiplied by the attempt number).
    #[serde(default = "default_retry_backoff_millis")]
    #[garde(skip)]
    pub retry_backoff_millis: u64,

    /// Retrieved artifacts smaller than this are discarded.
    #[serde(default = "default_min_artifact_bytes")]
    #[garde(skip)]
    pub min_artifact_bytes: u64,

    /// Allowed difference between the retrieved size and the declared size.
    #[serde(default = "default_size_tolerance_bytes")]
    #[garde(skip)]
    pub size_tolerance_bytes: u64,

    /// Number of prompt characters used to recognise a job's feed items.
    #[serde(default = "default_prompt_match_chars")]
    #[garde(range(min = 10, max = 1000))]
    pub prompt_match_chars: usize,

    /// Bounded wait for workers to exit in `stop(wait = true)`.
    #[serde(default = "default_stop_grace_seconds")]
    #[garde(skip)]
    pub stop_grace_seconds: u64,
}

fn default_profiles_dir() -> PathBuf {
    PathBuf::from("profiles")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_threads() -> usize {
    4
}

fn default_thread_delay_seconds() -> u64 {
    2
}

fn default_wait_timeout_seconds() -> u64 {
    300
}

fn default_refresh_interval_seconds() -> u64 {
    15
}

fn default_notification_poll_seconds() -> u64 {
    2
}

fn default_queue_poll_millis() -> u64 {
    1000
}

fn default_stage_retries() -> u32 {
    3
}

fn default_retry_backoff_millis() -> u64 {
    1000
}

fn default_min_artifact_bytes() -> u64 {
    1024
}

fn default_size_tolerance_bytes() -> u64 {
    1024
}

fn default_prompt_match_chars() -> usize {
    100
}

fn default_stop_grace_seconds() -> u64 {
    5
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profiles_dir: default_profiles_dir(),
            download_dir: default_download_dir(),
            max_threads: default_max_threads(),
            thread_delay_seconds: default_thread_delay_seconds(),
            wait_timeout_seconds: default_wait_timeout_seconds(),
            refresh_interval_seconds: default_refresh_interval_seconds(),
            notification_poll_seconds: default_notification_poll_seconds(),
            queue_poll_millis: default_queue_poll_millis(),
            stage_retries: default_stage_retries(),
            retry_backoff_millis: default_retry_backoff_millis(),
            min_artifact_bytes: default_min_artifact_bytes(),
            size_tolerance_bytes: default_size_tolerance_bytes(),
            prompt_match_chars: default_prompt_match_chars(),
            stop_grace_seconds: default_stop_grace_seconds(),
        }
    }
}

impl AppConfig {
    /// Load from `MEDIA_BATCH_*` environment variables (after reading `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            requested_threads: self.max_threads,
            inter_job_delay: Duration::from_secs(self.thread_delay_seconds),
            queue_poll: Duration::from_millis(self.queue_poll_millis),
            stop_grace: Duration::from_secs(self.stop_grace_seconds),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            download_dir: self.download_dir.clone(),
            wait_timeout: Duration::from_secs(self.wait_timeout_seconds),
            refresh_interval: Duration::from_secs(self.refresh_interval_seconds),
            notification_poll: Duration::from_secs(self.notification_poll_seconds),
            stage_retries: self.stage_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_millis),
            min_artifact_bytes: self.min_artifact_bytes,
            size_tolerance_bytes: self.size_tolerance_bytes,
            prompt_match_chars: self.prompt_match_chars,
        }
    }
}

/// Settings consumed by the worker pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub requested_threads: usize,
    pub inter_job_delay: Duration,
    pub queue_poll: Duration,
    pub stop_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        AppConfig::default().pool_settings()
    }
}

/// Settings consumed by the generation pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download_dir: PathBuf,
    pub wait_timeout: Duration,
    pub refresh_interval: Duration,
    pub notification_poll: Duration,
    pub stage_retries: u32,
    pub retry_backoff: Duration,
    pub min_artifact_bytes: u64,
    pub size_tolerance_bytes: u64,
    pub prompt_match_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        AppConfig::default().pipeline_settings()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
