use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence, when the extractor reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl BoundingBox {
    /// Build a box from `(top, right, bottom, left)` edges, the layout most
    /// face-location APIs return.
    pub fn from_edges(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            x: left,
            y: top,
            width: (right - left).max(0.0),
            height: (bottom - top).max(0.0),
            confidence: None,
        }
    }

    /// `(top, right, bottom, left)` edges.
    pub fn edges(&self) -> (f32, f32, f32, f32) {
        (self.y, self.x + self.width, self.y + self.height, self.x)
    }
}

/// Face embedding vector (128 or 512 dimensions depending on the extractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "dlib_resnet_v1").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Callers must check that dimensions agree; extra trailing values on
    /// the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face produced by the extraction capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity label is empty")]
    Empty,
    #[error("identity label {0:?} contains a path separator or control character")]
    InvalidCharacter(String),
    #[error("identity label {0:?} must not start with '.' or carry surrounding whitespace")]
    InvalidForm(String),
    #[error("national ID must be exactly 11 digits, got {0:?}")]
    InvalidNationalId(String),
}

/// Label of a registered person (a name or an external ID).
///
/// Labels double as file-name prefixes in registry storage, so anything
/// that could escape the registry directory is rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(label: impl Into<String>) -> Result<Self, IdentityError> {
        let label = label.into();
        if label.is_empty() {
            return Err(IdentityError::Empty);
        }
        if label
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(IdentityError::InvalidCharacter(label));
        }
        if label.starts_with('.') || label.trim() != label {
            return Err(IdentityError::InvalidForm(label));
        }
        Ok(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secondary identifier attached at registration (Brazilian CPF format).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NationalId(String);

impl NationalId {
    pub const LEN: usize = 11;

    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        if value.len() != Self::LEN || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentityError::InvalidNationalId(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NationalId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NationalId> for String {
    fn from(value: NationalId) -> Self {
        value.0
    }
}

impl fmt::Display for NationalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
