use crate::config::Config;
use presence_core::embedder::decode_image;
use presence_core::{
    EmbedError, Embedding, EnrolledIdentity, Enrollment, FaceEmbedder, GalleryIndex, OnnxEmbedder,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine request timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Embed {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EmbedError>>,
    },
    BuildGallery {
        enrollments: Vec<Enrollment>,
        reply: oneshot::Sender<Result<GalleryIndex, EmbedError>>,
    },
    EmbedIdentity {
        enrollment: Enrollment,
        reply: oneshot::Sender<Result<Option<EnrolledIdentity>, EmbedError>>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// The engine thread is the only owner of the ONNX sessions, so every
/// embedding in the process runs one at a time, in arrival order.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
    model_version: Arc<str>,
}

impl EngineHandle {
    /// Decode a photo and embed its most confident face.
    ///
    /// Bounded by the configured request timeout, time spent queued included.
    pub async fn embed(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let result = self
            .request(Some(self.timeout), |reply| EngineRequest::Embed { image, reply })
            .await?;
        Ok(result?)
    }

    /// Embed every enrollment and build a fresh gallery. Not time-bounded.
    pub async fn build_gallery(&self, enrollments: Vec<Enrollment>) -> Result<GalleryIndex, EngineError> {
        let result = self
            .request(None, |reply| EngineRequest::BuildGallery { enrollments, reply })
            .await?;
        Ok(result?)
    }

    /// Embed one identity's enrollment photos.
    pub async fn embed_identity(
        &self,
        enrollment: Enrollment,
    ) -> Result<Option<EnrolledIdentity>, EngineError> {
        let result = self
            .request(None, |reply| EngineRequest::EmbedIdentity { enrollment, reply })
            .await?;
        Ok(result?)
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn request<T>(
        &self,
        timeout: Option<Duration>,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(make(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| EngineError::Timeout(limit))?,
            None => exchange.await,
        }
    }
}

/// Load both ONNX models and spawn the engine. Fails fast if either model
/// is missing or unloadable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let embedder = OnnxEmbedder::load(&scrfd_path, &arcface_path, config.detector_confidence)?;
    tracing::info!(
        detector = %scrfd_path,
        recognizer = %arcface_path,
        detector_confidence = config.detector_confidence,
        "face models loaded"
    );
    spawn_engine_with(embedder, config.request_timeout())
}

/// Spawn the engine on a dedicated OS thread around an already-loaded embedder.
pub fn spawn_engine_with<E>(mut embedder: E, timeout: Duration) -> Result<EngineHandle, EngineError>
where
    E: FaceEmbedder + Send + 'static,
{
    let model_version: Arc<str> = Arc::from(embedder.model_version());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Embed { image, reply } => {
                        let result = decode_image(&image).and_then(|img| embedder.embed(&img));
                        if let Err(err) = &result {
                            tracing::debug!(error = %err, "probe embedding failed");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::BuildGallery { enrollments, reply } => {
                        let _ = reply.send(GalleryIndex::build(&mut embedder, &enrollments));
                    }
                    EngineRequest::EmbedIdentity { enrollment, reply } => {
                        let _ = reply.send(GalleryIndex::embed_identity(&mut embedder, &enrollment));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        timeout,
        model_version,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use presence_core::Identity;
    use std::io::Cursor;
    use presence_core::recognizer::RecognizerError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Maps mean brightness to a unit vector; black photos have no face.
    /// Tracks how many calls overlap. Fails like a broken model while
    /// `model_fault` is set.
    #[derive(Default)]
    pub(crate) struct ProbeEmbedder {
        pub active: Arc<AtomicUsize>,
        pub max_active: Arc<AtomicUsize>,
        pub model_fault: Arc<AtomicBool>,
        pub delay: Duration,
    }

    impl FaceEmbedder for ProbeEmbedder {
        fn embed(&mut self, image: &GrayImage) -> Result<Embedding, EmbedError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.model_fault.load(Ordering::SeqCst) {
                return Err(RecognizerError::InferenceFailed("model fault".into()).into());
            }

            let mean = image.pixels().map(|p| p[0] as f32).sum::<f32>() / image.len() as f32;
            if mean == 0.0 {
                return Err(EmbedError::NoFaceDetected);
            }
            let theta = mean / 255.0 * std::f32::consts::FRAC_PI_2;
            Ok(Embedding::new(vec![theta.cos(), theta.sin()]))
        }

        fn model_version(&self) -> &str {
            "probe-v1"
        }
    }

    pub(crate) fn png(brightness: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([brightness])))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_serialized() {
        let embedder = ProbeEmbedder {
            delay: Duration::from_millis(5),
            ..Default::default()
        };
        let max_active = embedder.max_active.clone();
        let engine = spawn_engine_with(embedder, Duration::from_secs(10)).unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16u8 {
            let engine = engine.clone();
            tasks.spawn(async move { engine.embed(png(10 + i * 10)).await });
        }
        while let Some(joined) = tasks.join_next().await {
            let embedding = joined.unwrap().unwrap();
            assert_eq!(embedding.dim(), 2);
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embed_reports_no_face() {
        let engine = spawn_engine_with(ProbeEmbedder::default(), Duration::from_secs(5)).unwrap();
        let err = engine.embed(png(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Embed(EmbedError::NoFaceDetected)));
    }

    #[tokio::test]
    async fn test_embed_reports_undecodable_image() {
        let engine = spawn_engine_with(ProbeEmbedder::default(), Duration::from_secs(5)).unwrap();
        let err = engine.embed(b"not a photo".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Embed(EmbedError::Decode(_))));
    }

    #[tokio::test]
    async fn test_slow_embedding_times_out() {
        let embedder = ProbeEmbedder {
            delay: Duration::from_millis(300),
            ..Default::default()
        };
        let engine = spawn_engine_with(embedder, Duration::from_millis(20)).unwrap();
        let err = engine.embed(png(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_model_fault_during_gallery_work_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.png");
        std::fs::write(&path, png(150)).unwrap();
        let enrollment = Enrollment {
            identity: Identity::new(1, "alice"),
            images: vec![path],
        };

        let embedder = ProbeEmbedder::default();
        embedder.model_fault.store(true, Ordering::SeqCst);
        let engine = spawn_engine_with(embedder, Duration::from_secs(5)).unwrap();

        let err = engine.build_gallery(vec![enrollment.clone()]).await.unwrap_err();
        assert!(matches!(err, EngineError::Embed(EmbedError::Recognizer(_))));
        let err = engine.embed_identity(enrollment).await.unwrap_err();
        assert!(matches!(err, EngineError::Embed(EmbedError::Recognizer(_))));
    }

    #[tokio::test]
    async fn test_build_gallery_and_embed_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.png");
        std::fs::write(&path, png(150)).unwrap();
        let enrollment = Enrollment {
            identity: Identity::new(1, "alice"),
            images: vec![path],
        };

        let engine = spawn_engine_with(ProbeEmbedder::default(), Duration::from_secs(5)).unwrap();
        assert_eq!(engine.model_version(), "probe-v1");

        let index = engine.build_gallery(vec![enrollment.clone()]).await.unwrap();
        assert_eq!(index.reference_count(), 1);

        let entry = engine.embed_identity(enrollment).await.unwrap().unwrap();
        assert_eq!(entry.identity().name, "alice");
    }
}
