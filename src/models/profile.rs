use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Authentication state of a browser profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ProfileStatus {
    /// Never checked.
    #[default]
    Unknown,
    Authenticated,
    Unauthenticated,
    /// Was authenticated once but the session was revoked or expired.
    NeedsReauth,
    Checking,
}

/// A named, independently authenticated session resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub status: ProfileStatus,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: String,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_status(name, ProfileStatus::Unknown)
    }

    pub fn with_status(name: impl Into<String>, status: ProfileStatus) -> Self {
        Self {
            name: name.into(),
            status,
            last_checked: None,
            last_used: None,
            error_message: String::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == ProfileStatus::Authenticated
    }
}
