//! Persisted, cooldown-deduplicated sighting history.
//!
//! Storage is a single JSON object mapping identity label to its ordered
//! list of RFC 3339 timestamps. The file is rewritten in full (via temp file
//! and rename) after every accepted event.

use crate::persist::write_atomic;
use crate::types::Identity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default minimum spacing between two logged sightings of one identity.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("event log storage unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode event log: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of offering a sighting to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// First event ever recorded for the identity.
    FirstSighting,
    /// Cooldown elapsed since the last recorded event; appended.
    RepeatSighting,
    /// Within cooldown of the last recorded event; dropped.
    Suppressed,
}

impl EventOutcome {
    pub fn is_recorded(self) -> bool {
        !matches!(self, EventOutcome::Suppressed)
    }
}

/// How the on-disk log looked when it was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded { identities: usize },
    Missing,
    Empty,
    /// Present but unparseable; the log starts empty.
    Malformed(String),
    /// Present but unreadable; the log starts empty.
    Unreadable(String),
}

type Sightings = BTreeMap<Identity, Vec<DateTime<Utc>>>;

/// Identity → ordered sighting timestamps, bound to its storage file.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    sightings: Sightings,
}

impl EventLog {
    /// Empty, unsaved log bound to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sightings: BTreeMap::new(),
        }
    }

    /// Load the log at `path`.
    ///
    /// Never fails: missing or empty storage yields an empty log, and
    /// unreadable or malformed storage yields an empty log plus a warning.
    /// The returned [`LoadStatus`] tells the caller which case applied.
    pub fn open(path: impl Into<PathBuf>) -> (Self, LoadStatus) {
        let mut log = Self::new(path);

        let bytes = match fs::read(&log.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %log.path.display(), "no event log yet; starting empty");
                return (log, LoadStatus::Missing);
            }
            Err(e) => {
                tracing::warn!(path = %log.path.display(), error = %e, "event log unreadable; starting empty");
                return (log, LoadStatus::Unreadable(e.to_string()));
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return (log, LoadStatus::Empty);
        }

        match serde_json::from_slice::<Sightings>(&bytes) {
            Ok(mut sightings) => {
                for timestamps in sightings.values_mut() {
                    timestamps.sort();
                }
                sightings.retain(|_, timestamps| !timestamps.is_empty());
                let identities = sightings.len();
                log.sightings = sightings;
                tracing::info!(path = %log.path.display(), identities, "event log loaded");
                (log, LoadStatus::Loaded { identities })
            }
            Err(e) => {
                tracing::warn!(path = %log.path.display(), error = %e, "event log malformed; starting empty");
                (log, LoadStatus::Malformed(e.to_string()))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offer a sighting of `identity` at `timestamp`.
    ///
    /// Appends when the identity is new or when at least `cooldown` has
    /// passed since its last *recorded* event. Suppressed calls leave the
    /// log untouched, so they never push the cooldown window forward.
    /// A timestamp earlier than the last recorded one is suppressed.
    pub fn record_sighting(
        &mut self,
        identity: &Identity,
        timestamp: DateTime<Utc>,
        cooldown: Duration,
    ) -> EventOutcome {
        let Some(timestamps) = self.sightings.get_mut(identity) else {
            self.sightings.insert(identity.clone(), vec![timestamp]);
            return EventOutcome::FirstSighting;
        };

        let elapsed = timestamps
            .last()
            .and_then(|last| (timestamp - *last).to_std().ok());
        match elapsed {
            Some(elapsed) if elapsed >= cooldown => {
                timestamps.push(timestamp);
                EventOutcome::RepeatSighting
            }
            _ => EventOutcome::Suppressed,
        }
    }

    /// Rewrite the whole log to storage atomically.
    pub fn persist(&self) -> Result<(), EventLogError> {
        let bytes = serde_json::to_vec_pretty(&self.sightings)?;
        write_atomic(&self.path, &bytes).map_err(|source| EventLogError::StorageUnavailable {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), identities = self.sightings.len(), "event log flushed");
        Ok(())
    }

    /// Recorded sightings of one identity, oldest first.
    pub fn sightings(&self, identity: &Identity) -> &[DateTime<Utc>] {
        self.sightings.get(identity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_seen(&self, identity: &Identity) -> Option<DateTime<Utc>> {
        self.sightings(identity).last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &[DateTime<Utc>])> {
        self.sightings.iter().map(|(id, ts)| (id, ts.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.sightings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sightings.is_empty()
    }
}
