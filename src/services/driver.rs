//! Seam between the generation pipeline and whatever drives the live
//! generation surface (a browser session, a remote API shim, a test script).
//!
//! A driver owns exactly one session bound to one profile and is only ever
//! used from the worker thread that created it, so the trait requires `Send`
//! but not `Sync`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::generation::{FeedItem, Setting};
use crate::models::profile::Profile;

/// Outcome of a successful retrieval call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievedArtifact {
    /// Size the remote end declared for the artifact (e.g. a content length).
    pub declared_size: Option<u64>,
}

pub trait AutomationDriver: Send {
    /// Name of the profile whose session this driver holds.
    fn profile(&self) -> &str;

    /// Whether the session is currently signed in.
    fn is_authenticated(&mut self) -> Result<bool, DriverError>;

    /// Bring the session to the surface where prompts are entered.
    fn navigate_to_entry(&mut self) -> Result<(), DriverError>;

    /// Apply one generation control. Called in [`Setting`] order.
    fn apply_setting(&mut self, setting: &Setting) -> Result<(), DriverError>;

    /// Attach reference inputs to the pending generation.
    fn upload_references(&mut self, paths: &[PathBuf]) -> Result<(), DriverError>;

    fn set_prompt_text(&mut self, text: &str) -> Result<(), DriverError>;

    fn submit(&mut self) -> Result<(), DriverError>;

    /// Identifiers of every item currently visible in the shared feed.
    fn snapshot_feed_ids(&mut self) -> Result<HashSet<String>, DriverError>;

    /// Reload the feed so the next enumeration sees fresh state.
    fn refresh_feed(&mut self) -> Result<(), DriverError>;

    /// Unread count of the completion notification indicator, 0 if absent.
    fn notification_count(&mut self) -> Result<u32, DriverError> {
        Ok(0)
    }

    /// Feed items whose displayed text matches `prompt_prefix`, newest first.
    fn find_matching_feed_items(&mut self, prompt_prefix: &str) -> Result<Vec<FeedItem>, DriverError>;

    /// Open `item` and write its artifact to `destination`.
    fn retrieve_artifact(
        &mut self,
        item: &FeedItem,
        destination: &Path,
    ) -> Result<RetrievedArtifact, DriverError>;
}

/// Creates a driver bound to a profile's session storage.
pub trait DriverFactory: Send + Sync {
    fn connect(&self, profile: &Profile) -> Result<Box<dyn AutomationDriver>, DriverError>;
}

impl<F> DriverFactory for F
where
    F: Fn(&Profile) -> Result<Box<dyn AutomationDriver>, DriverError> + Send + Sync,
{
    fn connect(&self, profile: &Profile) -> Result<Box<dyn AutomationDriver>, DriverError> {
        self(profile)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A UI element could not be located. Usually succeeds on retry.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// The underlying session is unusable and must be rebuilt.
    #[error("Session error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Driver error: {0}")]
    Other(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::ElementNotFound(_))
    }

    pub fn is_session_fatal(&self) -> bool {
        matches!(self, DriverError::Session(_))
    }
}
