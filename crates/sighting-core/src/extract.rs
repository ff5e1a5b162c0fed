//! Seams to the external collaborators: frame acquisition and face
//! embedding extraction. The engine never looks inside a frame itself.

use crate::types::Detection;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ExtractError {
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("frame cannot be decoded: {0}")]
    InvalidFrame(String),
}

/// The frame source stopped producing frames.
#[derive(Error, Debug)]
#[error("frame acquisition failed: {reason}")]
pub struct AcquisitionError {
    pub reason: String,
}

impl AcquisitionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Produces zero or more (bounding box, embedding) pairs per frame.
///
/// An empty result means no face was found and is not an error.
/// Detections are returned in detector order; callers preserve it.
pub trait FaceExtractor {
    type Frame;

    fn extract(&mut self, frame: &Self::Frame) -> Result<Vec<Detection>, ExtractError>;
}

impl<E: FaceExtractor + ?Sized> FaceExtractor for &mut E {
    type Frame = E::Frame;

    fn extract(&mut self, frame: &Self::Frame) -> Result<Vec<Detection>, ExtractError> {
        (**self).extract(frame)
    }
}
