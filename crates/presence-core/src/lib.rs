//! presence-core: face matching and attendance decision engine.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime for CPU inference. Matching is a cosine-distance
//! nearest-neighbour search over enrolled reference embeddings; the result is
//! fused with a haversine geofence check into an attendance status.

pub mod alignment;
pub mod decision;
pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod geofence;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use decision::{decide, AttendanceRecord, AttendanceStatus, Coordinates};
pub use embedder::{EmbedError, FaceEmbedder, OnnxEmbedder};
pub use gallery::{EnrolledIdentity, Enrollment, GalleryIndex, NearestNeighborIndex, SharedGallery};
pub use geofence::{GeofenceResult, OfficeLocation};
pub use matcher::{CosineMatcher, MatchPolicy, MatchResult, Matcher};
pub use types::{BoundingBox, Embedding, Identity};

/// Default directory for ONNX model files: `$XDG_DATA_HOME/presence/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    data_dir().join("models")
}

/// Per-user data directory: `$XDG_DATA_HOME/presence` (or `~/.local/share/presence`).
pub fn data_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}
