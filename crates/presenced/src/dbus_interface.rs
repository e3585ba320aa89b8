use crate::service::{rejection_json, AttendanceError, AttendanceService};
use crate::store::Store;
use presence_core::Coordinates;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Presence1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Presence1";

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
pub struct PresenceService {
    service: Arc<AttendanceService<Store>>,
}

impl PresenceService {
    pub fn new(service: Arc<AttendanceService<Store>>) -> Self {
        Self { service }
    }
}

/// Faults are logged in full and reported to callers as an opaque failure.
fn internal(err: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::error!(error = %err, "request failed");
    zbus::fdo::Error::Failed("internal error".into())
}

fn check_coordinates(latitude: f64, longitude: f64) -> zbus::fdo::Result<()> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "coordinates out of range: {latitude}, {longitude}"
        )));
    }
    Ok(())
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Check in with a photo and the device's coordinates.
    ///
    /// Returns JSON: the attendance record, or `{"status": "rejected", "reason": ...}`
    /// when no enrolled face was recognized.
    async fn mark_attendance(
        &self,
        image: Vec<u8>,
        latitude: f64,
        longitude: f64,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), latitude, longitude, "mark_attendance requested");
        check_coordinates(latitude, longitude)?;
        if image.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("image is empty".into()));
        }

        match self
            .service
            .mark_attendance(image, Coordinates { latitude, longitude })
            .await
        {
            Ok(outcome) => Ok(outcome.to_json().to_string()),
            Err(err) if err.is_rejection() => Ok(rejection_json(&err).to_string()),
            Err(AttendanceError::ConfigurationMissing) => {
                tracing::error!("check-in attempted before an office location was set");
                Err(zbus::fdo::Error::Failed("office location is not configured".into()))
            }
            Err(err) => Err(internal(err)),
        }
    }

    /// Create a user. Returns the new user id.
    async fn add_user(&self, name: &str) -> zbus::fdo::Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("name is empty".into()));
        }
        match self.service.store().add_user(name).await {
            Ok(identity) => Ok(identity.user_id),
            Err(err) => Err(internal(err)),
        }
    }

    /// Register enrollment photos (absolute paths) for a user and refresh
    /// their gallery entry. Returns how many reference embeddings they now have.
    async fn enroll(&self, user_id: i64, images: Vec<String>) -> zbus::fdo::Result<u32> {
        tracing::info!(user_id, count = images.len(), "enroll requested");
        let paths: Vec<PathBuf> = images.into_iter().map(PathBuf::from).collect();
        if let Some(relative) = paths.iter().find(|p| !p.is_absolute()) {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "image path must be absolute: {}",
                relative.display()
            )));
        }

        match self.service.enroll(user_id, &paths).await {
            Ok(references) => Ok(references as u32),
            Err(AttendanceError::Store(crate::store::StoreError::UnknownUser(id))) => {
                Err(zbus::fdo::Error::InvalidArgs(format!("unknown user id {id}")))
            }
            Err(err) => Err(internal(err)),
        }
    }

    /// Remove a user's enrollment photos. Returns how many were removed.
    async fn clear_enrollment(&self, user_id: i64) -> zbus::fdo::Result<u32> {
        match self.service.clear_enrollment(user_id).await {
            Ok(removed) => Ok(removed as u32),
            Err(err) => Err(internal(err)),
        }
    }

    /// Replace the office location. An empty address is reverse-geocoded.
    /// Returns the stored office as JSON.
    async fn set_office_location(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
        address: &str,
    ) -> zbus::fdo::Result<String> {
        check_coordinates(latitude, longitude)?;
        if !(radius_m.is_finite() && radius_m >= 0.0) {
            return Err(zbus::fdo::Error::InvalidArgs(format!("invalid radius {radius_m}")));
        }
        match self
            .service
            .set_office_location(latitude, longitude, radius_m, address)
            .await
        {
            Ok(office) => Ok(serde_json::to_string(&office).map_err(internal)?),
            Err(err) => Err(internal(err)),
        }
    }

    /// Re-embed every enrollment. Returns the number of identities in the gallery.
    async fn refresh_gallery(&self) -> zbus::fdo::Result<u32> {
        match self.service.rebuild_gallery().await {
            Ok(identities) => Ok(identities as u32),
            Err(err) => Err(internal(err)),
        }
    }

    /// Mark every user without a record today as absent. Returns how many.
    async fn sweep_absentees(&self) -> zbus::fdo::Result<u32> {
        match self.service.sweep_absentees().await {
            Ok(marked) => Ok(marked as u32),
            Err(err) => Err(internal(err)),
        }
    }

    /// Attendance records for a date (`YYYY-MM-DD`, empty for today) as a JSON array.
    async fn attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.trim().is_empty() {
            chrono::Local::now().date_naive()
        } else {
            date.trim()
                .parse::<chrono::NaiveDate>()
                .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("invalid date {date:?}")))?
        };
        let rows = self
            .service
            .store()
            .attendance_on(date)
            .await
            .map_err(internal)?;
        let body: Vec<serde_json::Value> = rows
            .into_iter()
            .map(|(id, record)| {
                let mut entry = serde_json::to_value(&record).unwrap_or_default();
                entry["attendance_id"] = serde_json::json!(id);
                entry
            })
            .collect();
        Ok(serde_json::Value::Array(body).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let gallery = self.service.gallery().snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_version": self.service.engine().model_version(),
            "models_loaded": true,
            "gallery_identities": gallery.len(),
            "gallery_references": gallery.reference_count(),
        })
        .to_string())
    }
}
