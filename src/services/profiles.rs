use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::models::profile::{Profile, ProfileStatus};

/// Status records file kept next to the profile directories.
pub const STATUS_FILE: &str = "profiles_status.json";

/// Tracks each profile's authentication state, persisted as JSON.
///
/// A profile exists when its storage directory exists under `root`. The
/// status file is reloaded at construction and rewritten after every mutation.
#[derive(Debug)]
pub struct ProfileRegistry {
    root: PathBuf,
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    /// Load recorded statuses from `root` and reconcile them with the profile
    /// directories present on disk.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProfileError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut registry = Self {
            profiles: load_status(&root.join(STATUS_FILE)),
            root,
        };
        registry.scan()?;
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reconcile recorded entries with the storage directories on disk: new
    /// directories become Unknown profiles, entries without storage are dropped.
    pub fn scan(&mut self) -> Result<(), ProfileError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                found.push(name.to_string());
            }
        }

        let before = self.profiles.len();
        self.profiles.retain(|name, _| found.contains(name));
        let removed = before - self.profiles.len();

        let mut added = 0;
        for name in found {
            if !self.profiles.contains_key(&name) {
                self.profiles.insert(name.clone(), Profile::new(name));
                added += 1;
            }
        }

        if added > 0 || removed > 0 {
            info!(added, removed, total = self.profiles.len(), "Profile scan reconciled storage");
        }
        self.save()
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// All profiles sorted by name.
    pub fn all(&self) -> Vec<Profile> {
        self.profiles.values().cloned().collect()
    }

    /// Profiles with status Authenticated, sorted by name. This list bounds
    /// how many workers a pool may start.
    pub fn authenticated_profiles(&self) -> Vec<Profile> {
        self.profiles
            .values()
            .filter(|p| p.is_authenticated())
            .cloned()
            .collect()
    }

    /// Update status, message and `last_checked`. Returns false for unknown names.
    pub fn set_status(
        &mut self,
        name: &str,
        status: ProfileStatus,
        message: &str,
    ) -> Result<bool, ProfileError> {
        let Some(profile) = self.profiles.get_mut(name) else {
            return Ok(false);
        };
        profile.status = status;
        profile.error_message = message.to_string();
        profile.last_checked = Some(Utc::now());
        info!(profile = name, status = %status, "Profile status updated");
        self.save()?;
        Ok(true)
    }

    pub fn mark_authenticated(&mut self, name: &str) -> Result<bool, ProfileError> {
        self.set_status(name, ProfileStatus::Authenticated, "")
    }

    pub fn mark_unauthenticated(&mut self, name: &str) -> Result<bool, ProfileError> {
        self.set_status(name, ProfileStatus::Unauthenticated, "")
    }

    pub fn mark_needs_reauth(&mut self, name: &str, reason: &str) -> Result<bool, ProfileError> {
        self.set_status(name, ProfileStatus::NeedsReauth, reason)
    }

    /// Record that a worker just used this profile.
    pub fn mark_used(&mut self, name: &str) -> Result<bool, ProfileError> {
        let Some(profile) = self.profiles.get_mut(name) else {
            return Ok(false);
        };
        profile.last_used = Some(Utc::now());
        self.save()?;
        Ok(true)
    }

    /// Allocate storage for a new, not yet authenticated profile.
    /// Returns false if the name is already registered.
    pub fn create_profile(&mut self, name: &str) -> Result<bool, ProfileError> {
        validate_name(name)?;
        if self.profiles.contains_key(name) {
            return Ok(false);
        }
        fs::create_dir_all(self.root.join(name))?;
        self.profiles.insert(
            name.to_string(),
            Profile::with_status(name, ProfileStatus::Unauthenticated),
        );
        self.save()?;
        info!(profile = name, "Profile created");
        Ok(true)
    }

    /// Remove a profile and reclaim its session storage.
    /// Returns false if the name is not registered.
    pub fn delete_profile(&mut self, name: &str) -> Result<bool, ProfileError> {
        if !self.profiles.contains_key(name) {
            return Ok(false);
        }
        let path = self.root.join(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        self.profiles.remove(name);
        self.save()?;
        info!(profile = name, "Profile deleted");
        Ok(true)
    }

    fn save(&self) -> Result<(), ProfileError> {
        let payload = serde_json::to_string_pretty(&self.profiles)?;
        let path = self.root.join(STATUS_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn load_status(path: &Path) -> BTreeMap<String, Profile> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_str::<BTreeMap<String, Profile>>(&raw) {
        Ok(mut profiles) => {
            // Keys are authoritative; repair records whose name drifted.
            for (name, profile) in profiles.iter_mut() {
                profile.name = name.clone();
            }
            info!(count = profiles.len(), "Loaded profile statuses");
            profiles
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Unreadable profile status file, starting fresh");
            BTreeMap::new()
        }
    }
}

fn validate_name(name: &str) -> Result<(), ProfileError> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(&['/', '\\'][..])
        || name == STATUS_FILE;
    if invalid {
        return Err(ProfileError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Static worker→profile binding computed once before a pool starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBinding {
    /// 1-based worker id.
    pub worker_id: usize,
    pub profile: Profile,
}

/// Bind `min(requested, profiles.len())` workers round-robin: worker *i*
/// gets `profiles[i mod N]`. Since the worker count never exceeds N, no
/// profile is bound twice.
pub fn assign_profiles(profiles: &[Profile], requested: usize) -> Vec<WorkerBinding> {
    let count = requested.min(profiles.len());
    (0..count)
        .map(|i| WorkerBinding {
            worker_id: i + 1,
            profile: profiles[i % profiles.len()].clone(),
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Profile status serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid profile name: {0:?}")]
    InvalidName(String),
}
