//! Job definitions loaded from a row-oriented manifest, with per-row status
//! written back as jobs progress.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use garde::Validate;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::models::job::{parse_duration_secs, Job, JobPayload, JobStatus, MediaType};
use crate::services::scheduler::JobObserver;

/// Status values that mark a row as already produced.
const COMPLETED_MARKERS: &[&str] = &["done", "completed", "success", "finished"];

/// Extensions probed when a reference image is named without one.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

pub trait DataSource: Send + Sync {
    /// Payloads for every runnable row, each tagged with a `source_ref`.
    fn load_jobs(&self, skip_completed: bool) -> Result<Vec<JobPayload>, DataSourceError>;

    /// Persist a status text for the row identified by `source_ref`.
    fn update_status(&self, source_ref: &str, status: &str) -> Result<(), DataSourceError>;
}

type Row = Map<String, Value>;

/// A JSON array of row objects.
///
/// Column names are matched case-insensitively with spaces folded to
/// underscores, so `"Save Name"`, `"save_name"` and `"savename"` all work.
/// Unknown columns are preserved when the file is rewritten.
#[derive(Debug)]
pub struct ManifestSource {
    path: PathBuf,
    image_dir: PathBuf,
    output_dir: PathBuf,
    rows: Mutex<Vec<Row>>,
}

impl ManifestSource {
    pub fn open(
        path: impl Into<PathBuf>,
        image_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, DataSourceError> {
        let path = path.into();
        let raw = fs::read_to_string(&path)?;
        let rows: Vec<Row> = serde_json::from_str(&raw)?;
        info!(path = %path.display(), rows = rows.len(), "Manifest loaded");
        Ok(Self {
            path,
            image_dir: image_dir.into(),
            output_dir: output_dir.into(),
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a one-row sample manifest to `path`.
    pub fn write_template(path: &Path) -> Result<(), DataSourceError> {
        let sample = serde_json::json!([{
            "stt": 1,
            "prompt": "A cinematic video of a sunset over mountains",
            "image": "sample",
            "save_name": "sunset_video",
            "path": "Nature",
            "type": "video",
            "aspect_ratio": "16:9",
            "duration": "10s",
            "variations": 1,
            "status": ""
        }]);
        fs::write(path, serde_json::to_string_pretty(&sample)?)?;
        Ok(())
    }

    fn rows(&self) -> MutexGuard<'_, Vec<Row>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn payload_for(&self, index: usize, row: &Row) -> Option<JobPayload> {
        let prompt = field(row, &["prompt"])?;

        let media_type = match field(row, &["type", "media_type"]) {
            Some(raw) => match raw.parse::<MediaType>() {
                Ok(media_type) => media_type,
                Err(_) => {
                    warn!(row = index, value = %raw, "Unknown media type, defaulting to video");
                    MediaType::Video
                }
            },
            None => MediaType::Video,
        };

        let duration_secs = field(row, &["duration"]).and_then(|raw| {
            let parsed = parse_duration_secs(&raw);
            if parsed.is_none() {
                warn!(row = index, value = %raw, "Unparseable duration ignored");
            }
            parsed
        });
        let variations = field(row, &["variations", "variation"])
            .and_then(|raw| raw.parse::<u8>().ok())
            .unwrap_or(1);

        let reference_images = field(row, &["image", "images"])
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| self.resolve_image(name))
                    .collect()
            })
            .unwrap_or_default();

        let stt = field(row, &["stt"]).unwrap_or_else(|| (index + 1).to_string());
        let stem = field(row, &["save_name", "savename"])
            .unwrap_or_else(|| format!("{media_type}_{stt}"));
        let mut folder = self.output_dir.clone();
        if let Some(sub) = field(row, &["path"]) {
            folder.push(sub);
        }
        let output = folder.join(format!("{stem}.{}", media_type.default_extension()));

        Some(JobPayload {
            prompt,
            reference_images,
            output: Some(output),
            media_type,
            aspect_ratio: field(row, &["aspect_ratio", "aspectratio"]),
            resolution: field(row, &["resolution"]),
            duration_secs,
            variations,
            source_ref: Some(index.to_string()),
        })
    }

    /// `name` under the image directory, as given or with a probed extension.
    /// Unresolved names are passed through unchanged.
    fn resolve_image(&self, name: &str) -> PathBuf {
        let direct = self.image_dir.join(name);
        if direct.is_file() {
            return direct;
        }
        IMAGE_EXTENSIONS
            .iter()
            .map(|ext| self.image_dir.join(format!("{name}.{ext}")))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(name))
    }

    fn persist(&self, rows: &[Row]) -> Result<(), DataSourceError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(rows)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DataSource for ManifestSource {
    fn load_jobs(&self, skip_completed: bool) -> Result<Vec<JobPayload>, DataSourceError> {
        let rows = self.rows();
        let mut payloads = Vec::new();
        let mut skipped = 0;
        for (index, row) in rows.iter().enumerate() {
            if skip_completed && field(row, &["status"]).is_some_and(|s| is_completed_marker(&s)) {
                skipped += 1;
                continue;
            }
            let Some(payload) = self.payload_for(index, row) else {
                continue;
            };
            if let Err(report) = payload.validate() {
                warn!(row = index, error = %report, "Skipping invalid row");
                continue;
            }
            payloads.push(payload);
        }
        info!(jobs = payloads.len(), skipped, "Manifest jobs loaded");
        Ok(payloads)
    }

    fn update_status(&self, source_ref: &str, status: &str) -> Result<(), DataSourceError> {
        let mut rows = self.rows();
        let row = source_ref
            .parse::<usize>()
            .ok()
            .and_then(|index| rows.get_mut(index))
            .ok_or_else(|| DataSourceError::UnknownRow(source_ref.to_string()))?;

        let key = row
            .keys()
            .find(|key| normalize_key(key) == "status")
            .cloned()
            .unwrap_or_else(|| "status".to_string());
        row.insert(key, Value::String(status.to_string()));
        self.persist(&rows)
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(' ', "_")
}

/// First non-empty value among `names`, numbers rendered as text.
fn field(row: &Row, names: &[&str]) -> Option<String> {
    row.iter()
        .filter(|(key, _)| names.contains(&normalize_key(key).as_str()))
        .find_map(|(_, value)| match value {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
}

fn is_completed_marker(status: &str) -> bool {
    let status = status.trim().to_lowercase();
    COMPLETED_MARKERS.contains(&status.as_str())
}

/// Writes job progress back to the row each job was loaded from.
pub struct DataSourceObserver {
    source: Arc<dyn DataSource>,
}

impl DataSourceObserver {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self { source }
    }

    fn write(&self, job: &Job, status: &str) {
        let Some(source_ref) = job.payload.source_ref.as_deref() else {
            return;
        };
        if let Err(e) = self.source.update_status(source_ref, status) {
            warn!(job_id = job.id, source_ref, error = %e, "Failed to write back job status");
        }
    }
}

impl JobObserver for DataSourceObserver {
    fn job_started(&self, job: &Job) {
        self.write(job, "RUNNING");
    }

    fn job_finished(&self, job: &Job) {
        let status = match job.status {
            JobStatus::Completed => "DONE".to_string(),
            JobStatus::Failed => format!(
                "FAILED: {}",
                job.error.as_deref().unwrap_or("unknown error")
            ),
            JobStatus::Cancelled => "CANCELLED".to_string(),
            JobStatus::Pending | JobStatus::Running => return,
        };
        self.write(job, &status);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DataSourceError {
    #[error("Manifest I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown manifest row: {0}")]
    UnknownRow(String),
}
