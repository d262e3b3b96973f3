use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::models::job::{JobId, JobPayload};

/// Output base for a job: the payload's target, or `<download_dir>/job_<id>.<ext>`.
pub fn output_base(payload: &JobPayload, job_id: JobId, download_dir: &Path) -> PathBuf {
    let ext = payload.media_type.default_extension();
    match &payload.output {
        Some(path) if path.extension().is_some() => path.clone(),
        Some(path) => path.with_extension(ext),
        None => download_dir.join(format!("job_{job_id}.{ext}")),
    }
}

/// Destination of variation `index` (1-based) out of `total`.
///
/// A single variation keeps the base name; otherwise a zero-padded index is
/// appended to the file stem: `clip.mp4` → `clip_01.mp4`, `clip_02.mp4`.
pub fn variation_path(base: &Path, index: usize, total: usize) -> PathBuf {
    if total <= 1 {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}_{index:02}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index:02}"),
    };
    base.with_file_name(name)
}

/// Every variation path for a payload, in retrieval order.
pub fn variation_paths(payload: &JobPayload, job_id: JobId, download_dir: &Path) -> Vec<PathBuf> {
    let base = output_base(payload, job_id, download_dir);
    let total = payload.expected_count();
    (1..=total).map(|i| variation_path(&base, i, total)).collect()
}

/// Size constraints a retrieved artifact must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactRules {
    pub min_bytes: u64,
    pub size_tolerance: u64,
}

/// Check a retrieved artifact on disk against the size floor and, when the
/// remote end declared one, the expected size.
///
/// On failure the partial file is removed.
pub fn validate_artifact(
    path: &Path,
    declared_size: Option<u64>,
    rules: ArtifactRules,
) -> Result<u64, ValidationError> {
    let result = check_artifact(path, declared_size, rules);
    match &result {
        Ok(size) => info!(path = %path.display(), size, "Artifact validated"),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Artifact rejected");
            discard(path);
        }
    }
    result
}

fn check_artifact(
    path: &Path,
    declared_size: Option<u64>,
    rules: ArtifactRules,
) -> Result<u64, ValidationError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(ValidationError::Io(e)),
    };
    let actual = metadata.len();

    if actual < rules.min_bytes {
        return Err(ValidationError::TooSmall {
            actual,
            minimum: rules.min_bytes,
        });
    }
    if let Some(expected) = declared_size {
        if actual.abs_diff(expected) > rules.size_tolerance {
            return Err(ValidationError::SizeMismatch { expected, actual });
        }
    }
    Ok(actual)
}

/// Best-effort removal of a partial artifact.
pub fn discard(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove partial artifact");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("artifact too small ({actual} bytes, minimum {minimum})")]
    TooSmall { actual: u64, minimum: u64 },

    #[error("artifact size mismatch (expected {expected} bytes, got {actual})")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("artifact missing at {0}")]
    Missing(PathBuf),

    #[error("artifact unreadable: {0}")]
    Io(#[from] std::io::Error),
}
