//! Photo → embedding.
//!
//! [`FaceEmbedder`] is the only surface through which the rest of the system
//! reaches the loaded models. The ONNX implementation chains SCRFD detection,
//! landmark alignment and ArcFace extraction.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    /// No face cleared the detector threshold. Bad input, not a fault.
    #[error("no face detected")]
    NoFaceDetected,
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

impl EmbedError {
    /// True when the error describes the photo rather than the system.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::NoFaceDetected | Self::Decode(_) | Self::Detector(DetectorError::EmptyImage)
        )
    }
}

/// Converts one decoded photo into one embedding.
///
/// Implementations are not required to be `Sync`; callers that share an
/// embedder across requests must serialize access to it.
pub trait FaceEmbedder {
    fn embed(&mut self, image: &GrayImage) -> Result<Embedding, EmbedError>;

    /// Identifier of the model producing embeddings, for diagnostics.
    fn model_version(&self) -> &str {
        "unknown"
    }
}

impl<E: FaceEmbedder + ?Sized> FaceEmbedder for Box<E> {
    fn embed(&mut self, image: &GrayImage) -> Result<Embedding, EmbedError> {
        (**self).embed(image)
    }

    fn model_version(&self) -> &str {
        (**self).model_version()
    }
}

/// Decode an in-memory photo (any format the `image` crate knows) to grayscale.
pub fn decode_image(bytes: &[u8]) -> Result<GrayImage, EmbedError> {
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

/// Read and decode a photo from disk to grayscale.
pub fn load_image(path: &Path) -> Result<GrayImage, EmbedError> {
    Ok(image::open(path)?.to_luma8())
}

/// Pick the face to embed: the single most confident detection.
pub fn select_face(faces: &[BoundingBox]) -> Result<&BoundingBox, EmbedError> {
    if faces.len() > 1 {
        tracing::warn!(
            faces = faces.len(),
            "multiple faces detected; using the most confident one"
        );
    }
    faces
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .ok_or(EmbedError::NoFaceDetected)
}

/// SCRFD + ArcFace embedder backed by ONNX Runtime sessions.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    /// Load both models. `detector_confidence` is the minimum SCRFD score.
    pub fn load(
        detector_path: &str,
        recognizer_path: &str,
        detector_confidence: f32,
    ) -> Result<Self, EmbedError> {
        let detector = FaceDetector::load(detector_path)?
            .with_confidence_threshold(detector_confidence);
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self::new(detector, recognizer))
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&mut self, image: &GrayImage) -> Result<Embedding, EmbedError> {
        let faces = self.detector.detect(image)?;
        let face = select_face(&faces)?;
        tracing::debug!(confidence = face.confidence, "face selected for embedding");
        Ok(self.recognizer.extract(image, face)?)
    }

    fn model_version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }
}
