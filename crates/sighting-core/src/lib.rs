//! sighting-core — Identity matching and sighting-event engine.
//!
//! Classifies face embeddings against a registry of known identities by
//! Euclidean nearest neighbour, and keeps a persisted, cooldown-deduplicated
//! log of who was seen when. Face detection and embedding extraction stay
//! outside this crate behind the [`FaceExtractor`] trait.

pub mod events;
pub mod extract;
pub mod lock;
pub mod matcher;
mod persist;
pub mod registry;
pub mod session;
pub mod types;

pub use events::{EventLog, EventLogError, EventOutcome, LoadStatus, DEFAULT_COOLDOWN};
pub use extract::{AcquisitionError, ExtractError, FaceExtractor};
pub use lock::{LockError, StorageLock};
pub use matcher::{
    EuclideanMatcher, FaceMatch, MatchError, MatchOutcome, MatchResult, Matcher,
    DEFAULT_MATCH_THRESHOLD,
};
pub use registry::{
    Enrollment, FaceRegistration, Registration, RegistrationRequest, Registry, RegistryEntry,
    RegistryError, RegistrySnapshot, DEFAULT_DUPLICATE_TOLERANCE,
};
pub use session::{
    Clock, FaceReport, FrameReport, Session, SessionConfig, SessionError, SessionSummary,
    StopFlag, StopReason, SystemClock, DEFAULT_REPORT_EVERY, DEFAULT_SESSION_BUDGET,
};
pub use types::{BoundingBox, Detection, Embedding, Identity, IdentityError, NationalId};
