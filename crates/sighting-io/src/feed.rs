//! Precomputed detection feed.
//!
//! An external detector/embedder writes one JSON record per frame:
//!
//! ```json
//! {"sequence": 7, "faces": [{"bbox": {"x": 10, "y": 20, "width": 64, "height": 64},
//!                            "embedding": {"values": [0.01, -0.13, ...]}}]}
//! ```
//!
//! Still images use a single record in its own file; video and camera
//! streams use one record per line (JSON lines), read lazily.

use sighting_core::{AcquisitionError, Detection, ExtractError, FaceExtractor};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed detection record in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Extractor output for one frame or still image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Where the frame came from (file name, camera id), for reporting only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub faces: Vec<Detection>,
}

/// Extractor for frames whose detections were computed upstream.
///
/// Every face is passed through, including faces without an embedding;
/// registration and matching reject those one face at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecomputedExtractor;

impl FaceExtractor for PrecomputedExtractor {
    type Frame = FrameRecord;

    fn extract(&mut self, frame: &FrameRecord) -> Result<Vec<Detection>, ExtractError> {
        for (face, _) in frame.faces.iter().enumerate().filter(|(_, f)| f.embedding.is_empty()) {
            tracing::warn!(sequence = ?frame.sequence, face, "detection carries an empty embedding");
        }
        Ok(frame.faces.clone())
    }
}

/// Read a single-record file (one still image).
pub fn read_frame(path: &Path) -> Result<FrameRecord, FeedError> {
    let bytes = std::fs::read(path).map_err(|source| FeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| FeedError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Lazy JSON-lines frame source.
///
/// Blank lines are ignored. A read error or an unparseable line is an
/// [`AcquisitionError`]; the feed yields nothing after the first error.
pub struct DetectionFeed<R> {
    lines: Lines<R>,
    line_no: usize,
    failed: bool,
}

impl<R: BufRead> DetectionFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            failed: false,
        }
    }
}

impl DetectionFeed<Box<dyn BufRead + Send>> {
    /// Open a feed from a file, or from stdin when `path` is `-`.
    pub fn open(path: &Path) -> Result<Self, FeedError> {
        let reader: Box<dyn BufRead + Send> = if path == Path::new("-") {
            Box::new(BufReader::new(io::stdin()))
        } else {
            let file = File::open(path).map_err(|source| FeedError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Box::new(BufReader::new(file))
        };
        tracing::debug!(path = %path.display(), "detection feed opened");
        Ok(Self::new(reader))
    }
}

impl<R: BufRead> Iterator for DetectionFeed<R> {
    type Item = Result<FrameRecord, AcquisitionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            self.line_no += 1;
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(AcquisitionError::new(format!(
                        "read failed at line {}: {e}",
                        self.line_no
                    ))));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| {
                self.failed = true;
                AcquisitionError::new(format!("line {}: {e}", self.line_no))
            }));
        }
    }
}
