use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::job::{JobPayload, MediaType};

/// Text markers a feed tile shows while its generation is still running.
const PROGRESS_MARKERS: &[&str] = &["generating", "queued", "in queue", "processing", "rendering"];

/// Displayed prompts shorter than this are not trusted as truncated prefixes.
const MIN_TRUNCATED_MATCH: usize = 20;

/// Generation parameters applied to a session before submitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub media_type: MediaType,
    pub aspect_ratio: Option<String>,
    pub resolution: Option<String>,
    pub duration_secs: Option<u32>,
    pub variations: u8,
}

/// One control on the generation surface, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    MediaType(MediaType),
    AspectRatio(String),
    Resolution(String),
    Duration(u32),
    Variations(u8),
}

impl Setting {
    pub fn label(&self) -> &'static str {
        match self {
            Setting::MediaType(_) => "media_type",
            Setting::AspectRatio(_) => "aspect_ratio",
            Setting::Resolution(_) => "resolution",
            Setting::Duration(_) => "duration",
            Setting::Variations(_) => "variations",
        }
    }
}

impl GenerationSettings {
    /// Resolution and duration are video-only and dropped for images.
    pub fn from_payload(payload: &JobPayload) -> Self {
        let video = payload.media_type == MediaType::Video;
        Self {
            media_type: payload.media_type,
            aspect_ratio: payload.aspect_ratio.clone(),
            resolution: payload.resolution.clone().filter(|_| video),
            duration_secs: payload.duration_secs.filter(|_| video),
            variations: payload.variations.max(1),
        }
    }

    /// Settings that must be applied to move a session from `previous` to `self`.
    ///
    /// With no previous run, or when the media type changes (which resets the
    /// dependent controls), every present setting is returned. Media type is
    /// always first.
    pub fn changes_since(&self, previous: Option<&GenerationSettings>) -> Vec<Setting> {
        let previous = previous.filter(|prev| prev.media_type == self.media_type);
        let mut changes = Vec::new();

        if previous.is_none() {
            changes.push(Setting::MediaType(self.media_type));
        }
        if let Some(ratio) = &self.aspect_ratio {
            if previous.map_or(true, |prev| prev.aspect_ratio.as_ref() != Some(ratio)) {
                changes.push(Setting::AspectRatio(ratio.clone()));
            }
        }
        if self.media_type == MediaType::Video {
            if let Some(resolution) = &self.resolution {
                if previous.map_or(true, |prev| prev.resolution.as_ref() != Some(resolution)) {
                    changes.push(Setting::Resolution(resolution.clone()));
                }
            }
            if let Some(secs) = self.duration_secs {
                if previous.map_or(true, |prev| prev.duration_secs != Some(secs)) {
                    changes.push(Setting::Duration(secs));
                }
            }
        }
        if previous.map_or(true, |prev| prev.variations != self.variations) {
            changes.push(Setting::Variations(self.variations));
        }
        changes
    }
}

/// One entry of the shared feed as reported by the automation driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    /// Finished and retrievable.
    pub ready: bool,
    /// Shows a generation-error indicator.
    pub failed: bool,
    /// Size the feed advertises for the artifact, when it does.
    #[serde(default)]
    pub declared_size: Option<u64>,
}

impl FeedItem {
    pub fn ready(id: impl Into<String>) -> Self {
        Self { id: id.into(), ready: true, failed: false, declared_size: None }
    }

    pub fn in_progress(id: impl Into<String>) -> Self {
        Self { id: id.into(), ready: false, failed: false, declared_size: None }
    }

    pub fn failed(id: impl Into<String>) -> Self {
        Self { id: id.into(), ready: false, failed: true, declared_size: None }
    }

    pub fn is_in_progress(&self) -> bool {
        !self.ready && !self.failed
    }
}

/// What the latest feed observation says about an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Enough fresh matches, none still in progress.
    Ready,
    /// A fresh matching item shows a generation error.
    FailedTask,
    NotReady { matched: usize, in_progress: usize },
}

/// Pipeline-local bookkeeping for one submission.
///
/// `matched` only ever holds ids absent from `prior_ids`: a match must be new
/// relative to the pre-submission snapshot.
#[derive(Debug, Clone)]
pub struct GenerationAttempt {
    pub prompt_fingerprint: String,
    pub expected_count: usize,
    prior_ids: HashSet<String>,
    matched: Vec<FeedItem>,
    polls: u32,
}

impl GenerationAttempt {
    pub fn new(payload: &JobPayload, match_chars: usize) -> Self {
        Self {
            prompt_fingerprint: prompt_fingerprint(&payload.prompt, match_chars),
            expected_count: payload.expected_count(),
            prior_ids: HashSet::new(),
            matched: Vec::new(),
            polls: 0,
        }
    }

    pub fn set_prior(&mut self, prior_ids: HashSet<String>) {
        self.matched.retain(|item| !prior_ids.contains(&item.id));
        self.prior_ids = prior_ids;
    }

    pub fn prior_ids(&self) -> &HashSet<String> {
        &self.prior_ids
    }

    pub fn is_fresh(&self, id: &str) -> bool {
        !self.prior_ids.contains(id)
    }

    /// Fold one feed observation in. Items arrive newest-first, so they are
    /// walked in reverse to keep `matched` ordered oldest-appearance-first.
    /// Returns how many items were matched for the first time.
    pub fn observe(&mut self, items: &[FeedItem]) -> usize {
        self.polls += 1;
        let mut added = 0;
        for item in items.iter().rev() {
            if !self.is_fresh(&item.id) {
                continue;
            }
            match self.matched.iter_mut().find(|known| known.id == item.id) {
                Some(known) => *known = item.clone(),
                None => {
                    self.matched.push(item.clone());
                    added += 1;
                }
            }
        }
        added
    }

    pub fn readiness(&self) -> Readiness {
        if self.matched.iter().any(|item| item.failed) {
            return Readiness::FailedTask;
        }
        let in_progress = self.matched.iter().filter(|item| item.is_in_progress()).count();
        if self.matched.len() >= self.expected_count && in_progress == 0 {
            Readiness::Ready
        } else {
            Readiness::NotReady { matched: self.matched.len(), in_progress }
        }
    }

    pub fn matched(&self) -> &[FeedItem] {
        &self.matched
    }

    pub fn matched_ids(&self) -> Vec<String> {
        self.matched.iter().map(|item| item.id.clone()).collect()
    }

    /// The oldest `expected_count` matches, in retrieval order.
    pub fn selected(&self) -> &[FeedItem] {
        let take = self.expected_count.min(self.matched.len());
        &self.matched[..take]
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

/// Why a single variation was not retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationFailure {
    /// 1-based variation index.
    pub index: usize,
    pub item_id: Option<String>,
    pub reason: String,
}

/// Result value stored on a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub artifacts: Vec<PathBuf>,
    pub failures: Vec<VariationFailure>,
    pub matched_ids: Vec<String>,
}

impl GenerationOutcome {
    pub fn requested(&self) -> usize {
        self.artifacts.len() + self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        !self.artifacts.is_empty()
    }
}

/// Lowercased first `chars` characters of a prompt.
pub fn prompt_fingerprint(prompt: &str, chars: usize) -> String {
    prompt.trim().chars().take(chars).collect::<String>().to_lowercase()
}

/// Whether the text a feed tile displays belongs to the fingerprinted prompt.
/// Tiles that truncate the prompt match when the fingerprint starts with the
/// displayed text.
pub fn text_matches_prompt(displayed: &str, fingerprint: &str) -> bool {
    let displayed = displayed.trim().to_lowercase();
    if displayed.is_empty() || fingerprint.is_empty() {
        return false;
    }
    let displayed = displayed.trim_end_matches("...").trim_end_matches('…');
    displayed.contains(fingerprint)
        || (displayed.chars().count() >= MIN_TRUNCATED_MATCH && fingerprint.starts_with(displayed))
}

/// Whether a tile's text shows an in-progress indicator: a percentage or one
/// of the generating/queued markers.
pub fn shows_progress_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    if PROGRESS_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return true;
    }
    let chars: Vec<char> = lower.chars().collect();
    chars
        .windows(2)
        .any(|pair| pair[0].is_ascii_digit() && pair[1] == '%')
}
