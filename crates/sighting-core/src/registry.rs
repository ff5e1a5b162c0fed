//! Embedding registry: the durable set of (identity, reference embedding)
//! pairs, one JSON record per accepted shot.
//!
//! Records live in a flat directory as `{identity}_{n}.json`, where `n`
//! counts shots per identity starting at 1. The registry is the sole writer
//! of that directory and holds a [`StorageLock`] for as long as it is open.

use crate::extract::{AcquisitionError, FaceExtractor};
use crate::lock::{LockError, StorageLock};
use crate::persist::write_atomic;
use crate::types::{BoundingBox, Detection, Embedding, Identity, NationalId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default registration tolerance. A candidate is a duplicate when some
/// reference lies within `distance <= tolerance`.
///
/// Deliberately looser than identification's 0.5 so that near-misses are
/// refused at enrollment rather than enrolled as a second person.
pub const DEFAULT_DUPLICATE_TOLERANCE: f32 = 0.6;

const RECORD_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no face detected in registration source")]
    NoFaceDetected,
    #[error("candidate embedding is empty")]
    EmptyEmbedding,
    #[error("embedding has {actual} dimensions, registry uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("registry storage unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode reference record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Locked(#[from] LockError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}

/// One accepted reference embedding. Persisted as a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub identity: Identity,
    /// Shot number within the identity (the `n` in `{identity}_{n}`).
    pub index: u32,
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_id: Option<NationalId>,
    pub created_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn file_name(&self) -> String {
        format!("{}_{}.{RECORD_EXTENSION}", self.identity, self.index)
    }
}

/// In-memory, read-only view of the registry used for matching.
///
/// Ordered by `(identity, index)`; the order matters only for the matcher's
/// lowest-index tie-break.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: Vec<RegistryEntry>,
}

impl RegistrySnapshot {
    pub fn from_entries(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimension shared by every entry, or `None` when empty.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    /// True iff any reference lies within `tolerance` of `candidate`.
    pub fn is_duplicate(&self, candidate: &Embedding, tolerance: f32) -> bool {
        self.nearest_distance(candidate)
            .is_some_and(|dist| dist <= tolerance)
    }

    fn nearest_distance(&self, candidate: &Embedding) -> Option<f32> {
        nearest_distance(&self.entries, candidate)
    }

    /// Number of reference shots per identity.
    pub fn identities(&self) -> BTreeMap<&Identity, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(&entry.identity).or_insert(0) += 1;
        }
        counts
    }

    fn max_index(&self, identity: &Identity) -> u32 {
        self.entries
            .iter()
            .filter(|e| &e.identity == identity)
            .map(|e| e.index)
            .max()
            .unwrap_or(0)
    }
}

/// Outcome of a single registration attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Accepted(RegistryEntry),
    /// An existing reference already matches this face. Nothing was stored.
    RejectedDuplicate { distance: f32 },
}

/// What to register the faces of one source image as.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub identity: Identity,
    pub national_id: Option<NationalId>,
}

/// Per-face result of a batch registration.
#[derive(Debug)]
pub struct FaceRegistration {
    pub bbox: BoundingBox,
    pub outcome: Result<Registration, RegistryError>,
}

/// Totals for a multi-shot enrollment.
#[derive(Debug, Default)]
pub struct Enrollment {
    /// Stored shots, in capture order.
    pub accepted: Vec<RegistryEntry>,
    /// Faces refused because an earlier reference already covers them.
    pub duplicates: usize,
    /// Faces that could not be registered (empty or wrong-sized embeddings).
    pub failed: usize,
    /// Frames pulled from the source.
    pub frames: u64,
}

/// Open registry: storage directory, its lock, and the loaded snapshot.
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    snapshot: RegistrySnapshot,
    tolerance: f32,
    lock: StorageLock,
}

impl Registry {
    /// Lock the registry directory (creating it if missing) and load every
    /// reference record in it.
    ///
    /// Records that cannot be used are skipped with a warning: unparseable
    /// files, records carrying no embedding, and records whose dimension
    /// disagrees with the rest of the registry.
    pub fn open(dir: &Path) -> Result<Self, RegistryError> {
        let lock = StorageLock::acquire(dir)?;
        let snapshot = load_snapshot(dir)?;

        tracing::info!(
            dir = %dir.display(),
            references = snapshot.len(),
            identities = snapshot.identities().len(),
            "registry loaded"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            snapshot,
            tolerance: DEFAULT_DUPLICATE_TOLERANCE,
            lock,
        })
    }

    /// Override the duplicate tolerance used by [`register`](Self::register).
    pub fn with_duplicate_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> &RegistrySnapshot {
        &self.snapshot
    }

    pub fn duplicate_tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Split into the loaded snapshot and the lock guard, so the snapshot can
    /// move to another thread while the caller keeps the lock.
    pub fn into_parts(self) -> (RegistrySnapshot, StorageLock) {
        (self.snapshot, self.lock)
    }

    /// True iff any stored reference lies within `tolerance` of `candidate`.
    pub fn is_duplicate(&self, candidate: &Embedding, tolerance: f32) -> bool {
        self.snapshot.is_duplicate(candidate, tolerance)
    }

    /// Register one face embedding under `identity`.
    ///
    /// Rejected (without storing anything) when the face is already within
    /// the duplicate tolerance of any reference, whichever identity owns it.
    pub fn register(
        &mut self,
        identity: &Identity,
        candidate: Embedding,
        national_id: Option<&NationalId>,
    ) -> Result<Registration, RegistryError> {
        let references = self.snapshot.len();
        self.register_against(references, identity, candidate, national_id)
    }

    /// Register one face, checking duplicates against the first `references`
    /// snapshot entries only.
    fn register_against(
        &mut self,
        references: usize,
        identity: &Identity,
        candidate: Embedding,
        national_id: Option<&NationalId>,
    ) -> Result<Registration, RegistryError> {
        if candidate.is_empty() {
            return Err(RegistryError::EmptyEmbedding);
        }
        if let Some(expected) = self.snapshot.dim() {
            if candidate.dim() != expected {
                return Err(RegistryError::DimensionMismatch {
                    expected,
                    actual: candidate.dim(),
                });
            }
        }

        if let Some(distance) = nearest_distance(&self.snapshot.entries[..references], &candidate) {
            if distance <= self.tolerance {
                tracing::info!(
                    identity = %identity,
                    distance,
                    tolerance = self.tolerance,
                    "registration refused: face already registered"
                );
                return Ok(Registration::RejectedDuplicate { distance });
            }
        }

        let mut entry = RegistryEntry {
            identity: identity.clone(),
            index: self.snapshot.max_index(identity) + 1,
            embedding: candidate,
            national_id: national_id.cloned(),
            created_at: Utc::now(),
        };
        // Skipped (unreadable) records still own their file names.
        while self.dir.join(entry.file_name()).exists() {
            entry.index += 1;
        }

        let path = self.dir.join(entry.file_name());
        let bytes = serde_json::to_vec_pretty(&entry)?;
        write_atomic(&path, &bytes).map_err(|source| RegistryError::StorageUnavailable {
            path: path.clone(),
            source,
        })?;

        tracing::info!(identity = %identity, index = entry.index, path = %path.display(), "reference stored");
        self.snapshot.entries.push(entry.clone());
        Ok(Registration::Accepted(entry))
    }

    /// Register every face detected in one source image.
    ///
    /// Each face is handled independently: a rejection or failure for one
    /// face never prevents the others from being registered. Faces accepted
    /// earlier in the batch take part in the duplicate check for later ones.
    pub fn register_faces(
        &mut self,
        request: &RegistrationRequest,
        detections: Vec<Detection>,
    ) -> Result<Vec<FaceRegistration>, RegistryError> {
        if detections.is_empty() {
            return Err(RegistryError::NoFaceDetected);
        }

        let results = detections
            .into_iter()
            .map(|detection| {
                let outcome = self.register(
                    &request.identity,
                    detection.embedding,
                    request.national_id.as_ref(),
                );
                if let Err(e) = &outcome {
                    tracing::warn!(identity = %request.identity, error = %e, "face registration failed");
                }
                FaceRegistration {
                    bbox: detection.bbox,
                    outcome,
                }
            })
            .collect();

        Ok(results)
    }

    /// Capture up to `shots` references for one identity from a frame source.
    ///
    /// Every face of every frame is a candidate until `shots` are stored. The
    /// duplicate check only sees references that existed before enrollment
    /// began, so successive shots of the same person are all kept. Frames
    /// that fail extraction are skipped. An acquisition error ends the
    /// enrollment; shots stored before it stay on disk.
    pub fn enroll<E, I>(
        &mut self,
        request: &RegistrationRequest,
        extractor: &mut E,
        frames: I,
        shots: usize,
    ) -> Result<Enrollment, RegistryError>
    where
        E: FaceExtractor,
        I: IntoIterator<Item = Result<E::Frame, AcquisitionError>>,
    {
        let references = self.snapshot.len();
        let mut frames = frames.into_iter();
        let mut enrollment = Enrollment::default();

        while enrollment.accepted.len() < shots {
            let Some(frame) = frames.next() else {
                break;
            };
            let frame = frame?;
            enrollment.frames += 1;

            let detections = match extractor.extract(&frame) {
                Ok(detections) => detections,
                Err(e) => {
                    tracing::warn!(frame = enrollment.frames, error = %e, "extraction failed; skipping frame");
                    continue;
                }
            };

            for detection in detections {
                if enrollment.accepted.len() >= shots {
                    break;
                }
                match self.register_against(
                    references,
                    &request.identity,
                    detection.embedding,
                    request.national_id.as_ref(),
                ) {
                    Ok(Registration::Accepted(entry)) => enrollment.accepted.push(entry),
                    Ok(Registration::RejectedDuplicate { .. }) => enrollment.duplicates += 1,
                    Err(e @ (RegistryError::StorageUnavailable { .. } | RegistryError::Encode(_))) => {
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(identity = %request.identity, error = %e, "face registration failed");
                        enrollment.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            identity = %request.identity,
            stored = enrollment.accepted.len(),
            target = shots,
            frames = enrollment.frames,
            "enrollment finished"
        );
        Ok(enrollment)
    }
}

fn load_snapshot(dir: &Path) -> Result<RegistrySnapshot, RegistryError> {
    let unavailable = |source| RegistryError::StorageUnavailable {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for dirent in fs::read_dir(dir).map_err(unavailable)? {
        let path = dirent.map_err(unavailable)?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION);
        if is_record && !hidden && path.is_file() {
            paths.push(path);
        }
    }

    let mut entries: Vec<RegistryEntry> = Vec::with_capacity(paths.len());
    for path in paths {
        let entry = match read_record(&path) {
            Ok(entry) => entry,
            Err(reason) => {
                tracing::warn!(path = %path.display(), reason, "skipping reference record");
                continue;
            }
        };
        if entry.embedding.is_empty() {
            tracing::warn!(path = %path.display(), "skipping reference record: no face embedding");
            continue;
        }
        entries.push(entry);
    }

    entries.sort_by(|a, b| (&a.identity, a.index).cmp(&(&b.identity, b.index)));

    // The first record in canonical order fixes the registry's dimension.
    let Some(dim) = entries.first().map(|e| e.embedding.dim()) else {
        return Ok(RegistrySnapshot::default());
    };
    entries.retain(|e| {
        let keep = e.embedding.dim() == dim;
        if !keep {
            tracing::warn!(
                file = %e.file_name(),
                expected = dim,
                actual = e.embedding.dim(),
                "skipping reference record: dimension mismatch"
            );
        }
        keep
    });

    Ok(RegistrySnapshot::from_entries(entries))
}

fn nearest_distance(entries: &[RegistryEntry], candidate: &Embedding) -> Option<f32> {
    entries
        .iter()
        .filter(|e| e.embedding.dim() == candidate.dim())
        .map(|e| e.embedding.euclidean_distance(candidate))
        .reduce(f32::min)
}

fn read_record(path: &Path) -> Result<RegistryEntry, String> {
    let bytes = fs::read(path).map_err(|e| format!("unreadable: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("malformed: {e}"))
}
