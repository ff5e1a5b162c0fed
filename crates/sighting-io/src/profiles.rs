//! Opaque profile metadata, keyed by identity label or image file name.

use serde_json::Value;
use sighting_core::Identity;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("cannot read profile store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("profile store {path} must be a JSON object: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Read-only enrichment data for recognized identities. Values are never
/// interpreted, only passed through to callers.
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: BTreeMap<String, Value>,
}

impl ProfileStore {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let bytes = std::fs::read(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let profiles = serde_json::from_slice(&bytes).map_err(|source| ProfileError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self { profiles };
        tracing::debug!(path = %path.display(), profiles = store.len(), "profile store loaded");
        Ok(store)
    }

    pub fn from_map(profiles: BTreeMap<String, Value>) -> Self {
        Self { profiles }
    }

    /// Find the profile for `identity`.
    ///
    /// Tries the bare label, then `label.<image ext>`, then any image key
    /// named after one of the identity's shots (`label_<n>.<ext>`).
    pub fn lookup(&self, identity: &Identity) -> Option<&Value> {
        let label = identity.as_str();
        if let Some(profile) = self.profiles.get(label) {
            return Some(profile);
        }
        for ext in IMAGE_EXTENSIONS {
            if let Some(profile) = self.profiles.get(&format!("{label}.{ext}")) {
                return Some(profile);
            }
        }
        self.profiles
            .iter()
            .find(|(key, _)| shot_owner(key) == Some(label))
            .map(|(_, profile)| profile)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// `"joao_3.jpg"` → `Some("joao")`.
fn shot_owner(key: &str) -> Option<&str> {
    let (stem, ext) = key.rsplit_once('.')?;
    if !IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }
    let (owner, n) = stem.rsplit_once('_')?;
    n.parse::<u32>().ok().map(|_| owner)
}
