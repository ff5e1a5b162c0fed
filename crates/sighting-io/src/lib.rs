//! sighting-io — Adapters for the engine's external collaborators.
//!
//! Reads detection records produced by an external face detector/embedder
//! (still images and JSON-lines streams) and serves opaque profile metadata
//! for recognized identities.

pub mod feed;
pub mod profiles;

pub use feed::{read_frame, DetectionFeed, FeedError, FrameRecord, PrecomputedExtractor};
pub use profiles::{ProfileError, ProfileStore};
