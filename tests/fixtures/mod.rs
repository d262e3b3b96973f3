//! Payload and settings fixtures shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use media_batch::config::{PipelineSettings, PoolSettings};
use media_batch::models::job::{JobPayload, MediaType};
use media_batch::services::profiles::ProfileRegistry;

/// Prompts used across tests. Distinct prefixes so feed matching never
/// confuses one job's items with another's.
pub const PROMPTS: &[&str] = &[
    "A lighthouse on a cliff during a thunderstorm, waves crashing below",
    "A red fox trotting through fresh snow in a pine forest at dawn",
    "Aerial shot of a neon city at night with flying cars weaving between towers",
    "Close-up of raindrops sliding down a window with a blurred cafe behind",
    "A paper boat drifting down a gutter stream after a spring rain shower",
];

/// Size every fake artifact is written with; above the default size floor.
pub const ARTIFACT_BYTES: usize = 4096;

pub fn video_payload(prompt: &str, output: &Path) -> JobPayload {
    JobPayload {
        aspect_ratio: Some("16:9".into()),
        resolution: Some("720p".into()),
        duration_secs: Some(10),
        ..JobPayload::new(prompt).with_output(output)
    }
}

pub fn image_payload(prompt: &str, output: &Path) -> JobPayload {
    JobPayload {
        aspect_ratio: Some("1:1".into()),
        ..JobPayload::new(prompt)
            .with_output(output)
            .with_media_type(MediaType::Image)
    }
}

/// Fast polling settings for a pipeline driven by a manual clock.
pub fn pipeline_settings(download_dir: &Path) -> PipelineSettings {
    PipelineSettings {
        download_dir: download_dir.to_path_buf(),
        wait_timeout: Duration::from_secs(300),
        refresh_interval: Duration::from_secs(15),
        notification_poll: Duration::from_secs(2),
        stage_retries: 3,
        retry_backoff: Duration::from_millis(100),
        min_artifact_bytes: 1024,
        size_tolerance_bytes: 1024,
        prompt_match_chars: 100,
    }
}

pub fn pool_settings(threads: usize) -> PoolSettings {
    PoolSettings {
        requested_threads: threads,
        inter_job_delay: Duration::ZERO,
        queue_poll: Duration::from_millis(20),
        stop_grace: Duration::from_secs(10),
    }
}

/// A registry under `root` holding the given profiles, all authenticated.
pub fn authenticated_registry(root: &Path, names: &[&str]) -> Arc<Mutex<ProfileRegistry>> {
    let mut registry = ProfileRegistry::open(root).unwrap();
    for name in names {
        registry.create_profile(name).unwrap();
        registry.mark_authenticated(name).unwrap();
    }
    Arc::new(Mutex::new(registry))
}
