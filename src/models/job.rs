use std::path::PathBuf;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::generation::GenerationOutcome;

/// Monotonic job identifier, assigned at enqueue starting from 1.
pub type JobId = u64;

/// Lifecycle status of a generation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, Failed and Cancelled jobs are never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Kind of artifact a job asks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MediaType {
    Image,
    #[default]
    Video,
}

impl MediaType {
    /// File extension used when the output target does not carry one.
    pub fn default_extension(self) -> &'static str {
        match self {
            MediaType::Image => "png",
            MediaType::Video => "mp4",
        }
    }
}

/// Everything a worker needs to run one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct JobPayload {
    #[garde(length(min = 1, max = 4000))]
    pub prompt: String,

    #[serde(default)]
    #[garde(skip)]
    pub reference_images: Vec<PathBuf>,

    /// Base output path; variation suffixes are derived from it.
    #[serde(default)]
    #[garde(skip)]
    pub output: Option<PathBuf>,

    #[serde(default)]
    #[garde(skip)]
    pub media_type: MediaType,

    #[serde(default)]
    #[garde(skip)]
    pub aspect_ratio: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub resolution: Option<String>,

    /// Clip length in seconds (video only).
    #[serde(default)]
    #[garde(range(min = 1, max = 60))]
    pub duration_secs: Option<u32>,

    #[serde(default = "default_variations")]
    #[garde(range(min = 1, max = 4))]
    pub variations: u8,

    /// Row reference in the data source this payload was loaded from.
    #[serde(default)]
    #[garde(skip)]
    pub source_ref: Option<String>,
}

fn default_variations() -> u8 {
    1
}

impl JobPayload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_images: Vec::new(),
            output: None,
            media_type: MediaType::default(),
            aspect_ratio: None,
            resolution: None,
            duration_secs: None,
            variations: default_variations(),
            source_ref: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_variations(mut self, variations: u8) -> Self {
        self.variations = variations;
        self
    }

    pub fn with_reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_images.push(path.into());
        self
    }

    /// Number of variations to retrieve, never less than one.
    pub fn expected_count(&self) -> usize {
        usize::from(self.variations.max(1))
    }
}

/// Accepts `5`, `5s`, `5 sec` or `5 seconds`.
pub fn parse_duration_secs(raw: &str) -> Option<u32> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let digits = trimmed
        .trim_end_matches("seconds")
        .trim_end_matches("second")
        .trim_end_matches("sec")
        .trim_end_matches('s')
        .trim();
    digits.parse().ok().filter(|secs| *secs > 0)
}

/// A generation job as tracked by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub result: Option<GenerationOutcome>,
    pub error: Option<String>,
    pub assigned_worker: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, payload: JobPayload) -> Self {
        Self {
            id,
            payload,
            status: JobStatus::Pending,
            result: None,
            error: None,
            assigned_worker: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Wall time between start and completion, if both were recorded.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Aggregate job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_media_type_parsing() {
        assert_eq!(MediaType::from_str("Image").unwrap(), MediaType::Image);
        assert_eq!(MediaType::from_str("video").unwrap(), MediaType::Video);
        assert!(MediaType::from_str("gif").is_err());
        assert_eq!(MediaType::Video.default_extension(), "mp4");
    }

    #[test]
    fn test_parse_duration_variants() {
        assert_eq!(parse_duration_secs("5"), Some(5));
        assert_eq!(parse_duration_secs("10s"), Some(10));
        assert_eq!(parse_duration_secs("15 seconds"), Some(15));
        assert_eq!(parse_duration_secs(" 20 sec "), Some(20));
        assert_eq!(parse_duration_secs("0"), None);
        assert_eq!(parse_duration_secs("long"), None);
    }

    #[test]
    fn test_payload_validation() {
        assert!(JobPayload::new("a lighthouse at dusk").validate().is_ok());
        assert!(JobPayload::new("").validate().is_err());
        assert!(JobPayload::new("x").with_variations(0).validate().is_err());
        assert!(JobPayload::new("x").with_variations(5).validate().is_err());
    }

    #[test]
    fn test_payload_deserialize_defaults() {
        let payload: JobPayload = serde_json::from_str(r#"{"prompt": "waves"}"#).unwrap();
        assert_eq!(payload.variations, 1);
        assert_eq!(payload.media_type, MediaType::Video);
        assert!(payload.reference_images.is_empty());
        assert_eq!(payload.expected_count(), 1);
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(1, JobPayload::new("waves"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.duration().is_none());
    }
}
