//! Check-in pipeline: embed probe, match against the gallery snapshot,
//! evaluate the geofence, decide, persist.

use crate::engine::{EngineError, EngineHandle};
use crate::geocode::{resolve_address, Geocoder};
use crate::store::{AttendanceSink, EnrollmentSource, OfficeSource, Store, StoreError, StoredAttendance};
use chrono::SubsecRound;
use presence_core::geofence::round2;
use presence_core::{
    AttendanceRecord, Coordinates, CosineMatcher, EmbedError, Identity, MatchPolicy,
    Matcher, OfficeLocation, SharedGallery,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("no face detected in photo")]
    NoFaceDetected,
    #[error("photo could not be decoded")]
    UnreadableImage,
    #[error("face not recognized (distance {distance:.4})")]
    UnknownIdentity { distance: f32 },
    #[error("office location is not configured")]
    ConfigurationMissing,
    #[error("store: {0}")]
    Store(#[source] StoreError),
    #[error("failed to persist attendance: {0}")]
    PersistenceFailure(#[source] StoreError),
    #[error("engine: {0}")]
    Engine(#[source] EngineError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl AttendanceError {
    /// True for outcomes caused by the submitted photo, as opposed to faults
    /// in the service.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NoFaceDetected | Self::UnreadableImage | Self::UnknownIdentity { .. }
        )
    }
}

impl From<EngineError> for AttendanceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Embed(EmbedError::NoFaceDetected) => Self::NoFaceDetected,
            EngineError::Embed(err) if err.is_input_error() => Self::UnreadableImage,
            other => Self::Engine(other),
        }
    }
}

impl From<StoreError> for AttendanceError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// A persisted check-in.
#[derive(Debug, Clone)]
pub struct CheckInOutcome {
    pub user: Identity,
    pub stored: StoredAttendance,
    pub record: AttendanceRecord,
    pub distance_from_office_m: f64,
}

impl CheckInOutcome {
    /// Response payload. Numbers are rounded to two decimals here and only here.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "message": "attendance marked",
            "user": self.user.name,
            "user_id": self.user.user_id,
            "status": self.record.status,
            "distance_from_office_m": round2(self.distance_from_office_m),
            "confidence": round2(f64::from(self.record.confidence)),
            "face_verified": self.record.face_verified,
            "location_verified": self.record.location_verified,
            "address": self.record.resolved_address,
            "attendance_id": self.stored.id,
            "date": self.stored.date.to_string(),
            "time": self.stored.time.format("%H:%M:%S").to_string(),
        })
    }
}

/// Rejection payload for an attempt that produced no record.
pub fn rejection_json(err: &AttendanceError) -> serde_json::Value {
    let mut body = json!({
        "status": "rejected",
        "reason": err.to_string(),
    });
    if let AttendanceError::UnknownIdentity { distance } = err {
        body["distance"] = json!(round2(f64::from(*distance)));
    }
    body
}

pub struct AttendanceService<S> {
    engine: EngineHandle,
    gallery: SharedGallery,
    store: S,
    geocoder: Arc<dyn Geocoder>,
    matcher: CosineMatcher,
    policy: MatchPolicy,
    upload_dir: Option<PathBuf>,
    /// Held by gallery writers from the enrollment read through the swap.
    gallery_writer: Mutex<()>,
}

impl<S> AttendanceService<S>
where
    S: EnrollmentSource + OfficeSource + AttendanceSink,
{
    pub fn new(engine: EngineHandle, store: S, geocoder: Arc<dyn Geocoder>, policy: MatchPolicy) -> Self {
        Self {
            engine,
            gallery: SharedGallery::default(),
            store,
            geocoder,
            matcher: CosineMatcher,
            policy,
            upload_dir: None,
            gallery_writer: Mutex::new(()),
        }
    }

    /// Keep accepted probe photos under `dir`.
    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn gallery(&self) -> &SharedGallery {
        &self.gallery
    }

    /// Re-embed every enrollment and swap in the new gallery.
    /// Returns the number of identities in it.
    pub async fn rebuild_gallery(&self) -> Result<usize, AttendanceError> {
        let _writer = self.gallery_writer.lock().await;
        let enrollments = self.store.enrollments().await?;
        let index = self.engine.build_gallery(enrollments).await?;
        let identities = index.len();
        tracing::info!(
            identities,
            references = index.reference_count(),
            "gallery rebuilt"
        );
        self.gallery.replace(index);
        Ok(identities)
    }

    /// Re-embed one user's enrollment photos and update their gallery entry.
    /// Returns the number of references now held for the user. On error the
    /// existing entry stays in the gallery.
    pub async fn refresh_identity(&self, user_id: i64) -> Result<usize, AttendanceError> {
        let _writer = self.gallery_writer.lock().await;
        let entry = match self.store.enrollment(user_id).await? {
            Some(enrollment) => self.engine.embed_identity(enrollment).await?,
            None => None,
        };
        let references = entry.as_ref().map_or(0, |e| e.embeddings().len());
        self.gallery.set_identity(user_id, entry);
        tracing::info!(user_id, references, "gallery entry refreshed");
        Ok(references)
    }

    /// Run one check-in attempt end to end.
    ///
    /// Rejections ([`AttendanceError::is_rejection`]) persist nothing. A
    /// recognized face always yields exactly one record, Present or Pending.
    pub async fn mark_attendance(
        &self,
        image: Vec<u8>,
        coordinates: Coordinates,
    ) -> Result<CheckInOutcome, AttendanceError> {
        // Fetch once; the whole attempt sees one consistent gallery.
        let gallery = self.gallery.snapshot();

        let probe = self.engine.embed(image.clone()).await?;
        let face = self.matcher.compare(&probe, &*gallery, &self.policy);
        let Some(identity) = face.identity.clone() else {
            tracing::info!(distance = face.distance, "check-in rejected: face not recognized");
            return Err(AttendanceError::UnknownIdentity {
                distance: face.distance,
            });
        };

        let office = self
            .store
            .office_location()
            .await?
            .ok_or(AttendanceError::ConfigurationMissing)?;
        let geofence = office.evaluate(coordinates.latitude, coordinates.longitude);
        let address =
            resolve_address(self.geocoder.as_ref(), coordinates.latitude, coordinates.longitude).await;

        let image_path = match &self.upload_dir {
            Some(dir) => Some(save_probe(dir, &image).await?),
            None => None,
        };

        let now = chrono::Local::now().naive_local().trunc_subsecs(0);
        let record = AttendanceRecord::check_in(
            &identity,
            &face,
            &geofence,
            coordinates,
            office.radius_m,
            address,
            image_path,
            now,
        );
        let stored = match self.store.record(&record).await {
            Ok(stored) => stored,
            Err(err) => {
                if let Some(path) = &record.image_path {
                    if let Err(io) = tokio::fs::remove_file(path).await {
                        tracing::warn!(path = %path.display(), error = %io, "failed to remove unrecorded check-in photo");
                    }
                }
                return Err(AttendanceError::PersistenceFailure(err));
            }
        };

        tracing::info!(
            user_id = identity.user_id,
            attendance_id = stored.id,
            status = %record.status,
            distance = face.distance,
            distance_from_office_m = geofence.distance_m,
            "attendance marked"
        );
        Ok(CheckInOutcome {
            user: identity,
            stored,
            record,
            distance_from_office_m: geofence.distance_m,
        })
    }
}

impl AttendanceService<Store> {
    /// Register enrollment photos for a user and refresh their gallery entry
    /// before returning. Returns the number of references now held.
    pub async fn enroll(&self, user_id: i64, images: &[PathBuf]) -> Result<usize, AttendanceError> {
        let added = self.store.add_images(user_id, images).await?;
        tracing::info!(user_id, added, "enrollment images registered");
        self.refresh_identity(user_id).await
    }

    /// Forget a user's enrollment photos and drop them from the gallery.
    /// Returns how many photos were removed.
    pub async fn clear_enrollment(&self, user_id: i64) -> Result<usize, AttendanceError> {
        let removed = self.store.remove_images(user_id).await?;
        self.refresh_identity(user_id).await?;
        tracing::info!(user_id, removed, "enrollment cleared");
        Ok(removed)
    }

    /// Replace the office location. An empty address is resolved from the
    /// coordinates.
    pub async fn set_office_location(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
        address: &str,
    ) -> Result<OfficeLocation, AttendanceError> {
        let resolved_address = if address.trim().is_empty() {
            resolve_address(self.geocoder.as_ref(), latitude, longitude).await
        } else {
            address.trim().to_string()
        };
        let office = OfficeLocation {
            latitude,
            longitude,
            radius_m,
            resolved_address,
        };
        self.store.set_office_location(&office).await?;
        tracing::info!(latitude, longitude, radius_m, address = %office.resolved_address, "office location set");
        Ok(office)
    }

    /// Mark every user without a record today as absent.
    pub async fn sweep_absentees(&self) -> Result<usize, AttendanceError> {
        let now = chrono::Local::now().naive_local().trunc_subsecs(0);
        Ok(self.store.sweep_absentees(now).await?)
    }
}

/// Write the probe photo to `dir/<uuid>.<ext>`.
async fn save_probe(dir: &Path, image: &[u8]) -> Result<PathBuf, std::io::Error> {
    let extension = image::guess_format(image)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("jpg");
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.{extension}", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, image).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine_with;
    use crate::engine::tests::{png, ProbeEmbedder};
    use crate::geocode::tests::FixedGeocoder;
    use async_trait::async_trait;
    use presence_core::decision::UNKNOWN_LOCATION;
    use presence_core::{AttendanceStatus, Enrollment};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const OFFICE_LAT: f64 = 27.7172;
    const OFFICE_LON: f64 = 85.3240;

    struct Fixture {
        service: AttendanceService<Store>,
        alice: Identity,
        dir: TempDir,
        model_fault: Arc<AtomicBool>,
    }

    async fn fixture(geocoder: Arc<dyn Geocoder>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let alice = store.add_user("alice").await.unwrap();
        let photo = dir.path().join("alice.png");
        std::fs::write(&photo, png(250)).unwrap();
        store.add_images(alice.user_id, &[photo]).await.unwrap();

        let embedder = ProbeEmbedder::default();
        let model_fault = embedder.model_fault.clone();
        let engine = spawn_engine_with(embedder, Duration::from_secs(5)).unwrap();
        let service = AttendanceService::new(engine, store, geocoder, MatchPolicy::default())
            .with_upload_dir(dir.path().join("uploads"));
        service
            .set_office_location(OFFICE_LAT, OFFICE_LON, 100.0, "HQ")
            .await
            .unwrap();
        service.rebuild_gallery().await.unwrap();
        Fixture {
            service,
            alice,
            dir,
            model_fault,
        }
    }

    fn at_office() -> Coordinates {
        Coordinates {
            latitude: OFFICE_LAT,
            longitude: OFFICE_LON,
        }
    }

    async fn records_today(service: &AttendanceService<Store>) -> Vec<AttendanceRecord> {
        let today = chrono::Local::now().date_naive();
        service
            .store()
            .attendance_on(today)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, r)| r)
            .collect()
    }

    #[tokio::test]
    async fn test_recognized_face_at_office_is_present() {
        let f = fixture(Arc::new(FixedGeocoder(Some("Durbar Marg, Kathmandu")))).await;
        let outcome = f.service.mark_attendance(png(250), at_office()).await.unwrap();

        assert_eq!(outcome.record.status, AttendanceStatus::Present);
        assert_eq!(outcome.user, f.alice);
        assert!(outcome.record.face_verified);
        assert!(outcome.record.location_verified);
        assert_eq!(outcome.record.resolved_address, "Durbar Marg, Kathmandu");

        let saved = outcome.record.image_path.clone().unwrap();
        assert!(saved.starts_with(f.dir.path().join("uploads")));
        assert_eq!(saved.extension().unwrap(), "png");
        assert_eq!(std::fs::read(&saved).unwrap(), png(250));

        let body = outcome.to_json();
        assert_eq!(body["user"], "alice");
        assert_eq!(body["status"], "Present");
        assert_eq!(body["distance_from_office_m"], 0.0);
        assert_eq!(body["attendance_id"], outcome.stored.id);

        assert_eq!(records_today(&f.service).await, vec![outcome.record]);
    }

    #[tokio::test]
    async fn test_recognized_face_outside_geofence_is_pending() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        let away = Coordinates {
            latitude: OFFICE_LAT + 0.01,
            longitude: OFFICE_LON,
        };
        let outcome = f.service.mark_attendance(png(250), away).await.unwrap();

        assert_eq!(outcome.record.status, AttendanceStatus::Pending);
        assert!(outcome.record.face_verified);
        assert!(!outcome.record.location_verified);
        assert!(outcome.distance_from_office_m > 1000.0);
        assert_eq!(outcome.record.resolved_address, UNKNOWN_LOCATION);
    }

    #[tokio::test]
    async fn test_unknown_face_is_rejected_without_record() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        let err = f.service.mark_attendance(png(10), at_office()).await.unwrap_err();

        assert!(matches!(err, AttendanceError::UnknownIdentity { distance } if distance >= 0.4));
        assert!(err.is_rejection());
        assert_eq!(rejection_json(&err)["status"], "rejected");
        assert!(records_today(&f.service).await.is_empty());
    }

    #[tokio::test]
    async fn test_photo_without_face_is_rejected() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        let err = f.service.mark_attendance(png(0), at_office()).await.unwrap_err();
        assert!(matches!(err, AttendanceError::NoFaceDetected));
        assert!(err.is_rejection());

        let err = f.service.mark_attendance(b"garbage".to_vec(), at_office()).await.unwrap_err();
        assert!(matches!(err, AttendanceError::UnreadableImage));
        assert!(records_today(&f.service).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_office_is_a_system_error() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = store.add_user("alice").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("alice.png");
        std::fs::write(&photo, png(250)).unwrap();
        store.add_images(alice.user_id, &[photo]).await.unwrap();

        let engine = spawn_engine_with(ProbeEmbedder::default(), Duration::from_secs(5)).unwrap();
        let service =
            AttendanceService::new(engine, store, Arc::new(FixedGeocoder(None)), MatchPolicy::default());
        service.rebuild_gallery().await.unwrap();

        let err = service.mark_attendance(png(250), at_office()).await.unwrap_err();
        assert!(matches!(err, AttendanceError::ConfigurationMissing));
        assert!(!err.is_rejection());
    }

    #[tokio::test]
    async fn test_enrollment_is_visible_to_next_check_in() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        let bob = f.service.store().add_user("bob").await.unwrap();
        let photo = f.dir.path().join("bob.png");
        std::fs::write(&photo, png(10)).unwrap();

        assert!(f.service.mark_attendance(png(10), at_office()).await.is_err());
        assert_eq!(f.service.enroll(bob.user_id, &[photo]).await.unwrap(), 1);

        let outcome = f.service.mark_attendance(png(10), at_office()).await.unwrap();
        assert_eq!(outcome.user, bob);
    }

    #[tokio::test]
    async fn test_cleared_enrollment_no_longer_matches() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        assert_eq!(f.service.clear_enrollment(f.alice.user_id).await.unwrap(), 1);
        assert!(f.service.gallery().snapshot().is_empty());

        let err = f.service.mark_attendance(png(250), at_office()).await.unwrap_err();
        assert!(matches!(err, AttendanceError::UnknownIdentity { .. }));
    }

    #[tokio::test]
    async fn test_sweep_after_check_in() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        f.service.store().add_user("bob").await.unwrap();
        f.service.mark_attendance(png(250), at_office()).await.unwrap();

        assert_eq!(f.service.sweep_absentees().await.unwrap(), 1);
        let records = records_today(&f.service).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, AttendanceStatus::Absent);
    }

    /// Delegates reads to a real store and fails every write.
    struct ReadOnlyStore(Store);

    #[async_trait]
    impl EnrollmentSource for ReadOnlyStore {
        async fn enrollments(&self) -> Result<Vec<Enrollment>, StoreError> {
            self.0.enrollments().await
        }
        async fn enrollment(&self, user_id: i64) -> Result<Option<Enrollment>, StoreError> {
            self.0.enrollment(user_id).await
        }
    }

    #[async_trait]
    impl OfficeSource for ReadOnlyStore {
        async fn office_location(&self) -> Result<Option<OfficeLocation>, StoreError> {
            self.0.office_location().await
        }
    }

    #[async_trait]
    impl AttendanceSink for ReadOnlyStore {
        async fn record(&self, _record: &AttendanceRecord) -> Result<StoredAttendance, StoreError> {
            Err(StoreError::Corrupt("read-only".into()))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        let Fixture { service, dir, .. } = f;
        let store = service.store().clone();
        let engine = service.engine().clone();
        let uploads = dir.path().join("uploads");
        let readonly = AttendanceService::new(
            engine,
            ReadOnlyStore(store),
            Arc::new(FixedGeocoder(None)),
            MatchPolicy::default(),
        )
        .with_upload_dir(uploads.clone());
        readonly.rebuild_gallery().await.unwrap();

        let err = readonly.mark_attendance(png(250), at_office()).await.unwrap_err();
        assert!(matches!(err, AttendanceError::PersistenceFailure(_)));
        assert!(!err.is_rejection());
        // The saved photo is not left behind without a record.
        assert_eq!(std::fs::read_dir(&uploads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_model_fault_during_enroll_keeps_existing_entry() {
        let f = fixture(Arc::new(FixedGeocoder(None))).await;
        let photo = f.dir.path().join("alice-2.png");
        std::fs::write(&photo, png(240)).unwrap();

        f.model_fault.store(true, Ordering::SeqCst);
        let err = f.service.enroll(f.alice.user_id, &[photo]).await.unwrap_err();
        assert!(matches!(err, AttendanceError::Engine(_)));
        assert!(!err.is_rejection());

        let gallery = f.service.gallery().snapshot();
        assert_eq!(gallery.get(f.alice.user_id).unwrap().embeddings().len(), 1);

        f.model_fault.store(false, Ordering::SeqCst);
        let outcome = f.service.mark_attendance(png(250), at_office()).await.unwrap();
        assert_eq!(outcome.user, f.alice);
    }

    #[test]
    fn test_empty_image_is_a_rejection() {
        let err = AttendanceError::from(EngineError::Embed(EmbedError::Detector(
            presence_core::detector::DetectorError::EmptyImage,
        )));
        assert!(matches!(err, AttendanceError::UnreadableImage));
        assert!(err.is_rejection());
    }

    /// Real store whose full enrollment listing returns a snapshot taken
    /// before a pause, like a slow query.
    struct SlowEnrollments {
        store: Store,
        pause: Duration,
    }

    #[async_trait]
    impl EnrollmentSource for SlowEnrollments {
        async fn enrollments(&self) -> Result<Vec<Enrollment>, StoreError> {
            let enrollments = self.store.enrollments().await?;
            tokio::time::sleep(self.pause).await;
            Ok(enrollments)
        }
        async fn enrollment(&self, user_id: i64) -> Result<Option<Enrollment>, StoreError> {
            self.store.enrollment(user_id).await
        }
    }

    #[async_trait]
    impl OfficeSource for SlowEnrollments {
        async fn office_location(&self) -> Result<Option<OfficeLocation>, StoreError> {
            self.store.office_location().await
        }
    }

    #[async_trait]
    impl AttendanceSink for SlowEnrollments {
        async fn record(&self, record: &AttendanceRecord) -> Result<StoredAttendance, StoreError> {
            self.store.record(record).await
        }
    }

    #[tokio::test]
    async fn test_rebuild_does_not_drop_concurrent_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let alice = store.add_user("alice").await.unwrap();
        let bob = store.add_user("bob").await.unwrap();
        let alice_photo = dir.path().join("alice.png");
        std::fs::write(&alice_photo, png(250)).unwrap();
        store.add_images(alice.user_id, &[alice_photo]).await.unwrap();
        let bob_photo = dir.path().join("bob.png");
        std::fs::write(&bob_photo, png(10)).unwrap();

        let engine = spawn_engine_with(ProbeEmbedder::default(), Duration::from_secs(5)).unwrap();
        let service = AttendanceService::new(
            engine,
            SlowEnrollments {
                store: store.clone(),
                pause: Duration::from_millis(200),
            },
            Arc::new(FixedGeocoder(None)),
            MatchPolicy::default(),
        );

        // The rebuild lists enrollments before bob has any photos; bob's
        // refresh lands while that listing is still in flight.
        let rebuild = service.rebuild_gallery();
        let enroll_bob = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.add_images(bob.user_id, &[bob_photo.clone()]).await.unwrap();
            service.refresh_identity(bob.user_id).await
        };
        let (rebuilt, refreshed) = tokio::join!(rebuild, enroll_bob);
        rebuilt.unwrap();
        assert_eq!(refreshed.unwrap(), 1);

        let gallery = service.gallery().snapshot();
        assert!(gallery.get(alice.user_id).is_some());
        assert!(gallery.get(bob.user_id).is_some());
    }
}
