//! Fusion of the face and geofence signals into an attendance record.

use crate::geofence::GeofenceResult;
use crate::matcher::MatchResult;
use crate::types::Identity;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Address recorded when reverse geocoding is unavailable.
pub const UNKNOWN_LOCATION: &str = "Unknown Location";
/// Address recorded on records created by the absentee sweep.
pub const NOT_MARKED: &str = "Not Marked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    /// Assigned only by the end-of-day sweep, never by [`decide`].
    Absent,
    /// Partial verification; queued for manual review.
    Pending,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::Pending => "Pending",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(Self::Present),
            "Absent" => Ok(Self::Absent),
            "Pending" => Ok(Self::Pending),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// Present iff the face matched and the geofence verified; Pending otherwise.
pub fn decide(face: &MatchResult, geofence: &GeofenceResult) -> AttendanceStatus {
    if face.is_match() && geofence.verified {
        AttendanceStatus::Present
    } else {
        AttendanceStatus::Pending
    }
}

/// Coordinates reported with a check-in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One persisted attendance outcome. Built once per request, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub user_id: i64,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
    pub face_verified: bool,
    pub location_verified: bool,
    pub confidence: f32,
    pub coordinates: Coordinates,
    pub resolved_address: String,
    /// Office radius in force when the check-in was evaluated.
    pub radius_m: f64,
    pub image_path: Option<PathBuf>,
}

impl AttendanceRecord {
    /// Record for a recognized identity. Status comes from [`decide`].
    #[allow(clippy::too_many_arguments)]
    pub fn check_in(
        identity: &Identity,
        face: &MatchResult,
        geofence: &GeofenceResult,
        coordinates: Coordinates,
        radius_m: f64,
        resolved_address: String,
        image_path: Option<PathBuf>,
        at: NaiveDateTime,
    ) -> Self {
        Self {
            user_id: identity.user_id,
            date: at.date(),
            time: at.time(),
            status: decide(face, geofence),
            face_verified: face.is_match(),
            location_verified: geofence.verified,
            confidence: face.confidence,
            coordinates,
            resolved_address,
            radius_m,
            image_path,
        }
    }

    /// Placeholder written by the end-of-day sweep for a user with no record.
    pub fn absent(user_id: i64, radius_m: f64, at: NaiveDateTime) -> Self {
        Self {
            user_id,
            date: at.date(),
            time: at.time(),
            status: AttendanceStatus::Absent,
            face_verified: false,
            location_verified: false,
            confidence: 0.0,
            coordinates: Coordinates {
                latitude: 0.0,
                longitude: 0.0,
            },
            resolved_address: NOT_MARKED.to_string(),
            radius_m,
            image_path: None,
        }
    }
}
