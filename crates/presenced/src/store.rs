//! SQLite-backed collaborators: enrollment images, office location,
//! attendance records.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use presence_core::{AttendanceRecord, AttendanceStatus, Coordinates, Enrollment, Identity, OfficeLocation};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

/// Radius used for absentee records when no office is configured.
const DEFAULT_RADIUS_M: f64 = 100.0;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS images (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    image_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS office_location (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    latitude         REAL NOT NULL,
    longitude        REAL NOT NULL,
    radius_meter     REAL NOT NULL DEFAULT 100,
    resolved_address TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id           INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    date              TEXT NOT NULL,
    time              TEXT NOT NULL,
    image_path        TEXT,
    latitude          REAL NOT NULL,
    longitude         REAL NOT NULL,
    resolved_address  TEXT NOT NULL,
    radius_meter      REAL NOT NULL,
    location_verified INTEGER NOT NULL,
    face_verified     INTEGER NOT NULL,
    status            TEXT NOT NULL,
    confidence        REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attendance_user_date ON attendance(user_id, date);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown user id {0}")]
    UnknownUser(i64),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Identifier and timestamp of a persisted attendance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAttendance {
    pub id: i64,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// Read-only source of enrollment photos.
#[async_trait]
pub trait EnrollmentSource: Send + Sync {
    /// Every user with their enrollment image paths (possibly none).
    async fn enrollments(&self) -> Result<Vec<Enrollment>, StoreError>;

    /// One user's enrollment, `None` for an unknown user.
    async fn enrollment(&self, user_id: i64) -> Result<Option<Enrollment>, StoreError>;
}

/// Read-only source of the office the geofence is checked against.
#[async_trait]
pub trait OfficeSource: Send + Sync {
    async fn office_location(&self) -> Result<Option<OfficeLocation>, StoreError>;
}

/// Write-only sink for attendance decisions.
#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn record(&self, record: &AttendanceRecord) -> Result<StoredAttendance, StoreError>;
}

/// SQLite store. Cheap to clone; all clones share one connection thread.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory().await?,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn add_user(&self, name: &str) -> Result<Identity, StoreError> {
        let name = name.to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let identity = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (name, created_at) VALUES (?1, ?2)",
                    params![name, created_at],
                )?;
                Ok(Identity::new(conn.last_insert_rowid(), name))
            })
            .await?;
        tracing::info!(user_id = identity.user_id, name = %identity.name, "user added");
        Ok(identity)
    }

    pub async fn user(&self, user_id: i64) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT id, name FROM users WHERE id = ?1", [user_id], |row| {
                        Ok(Identity::new(row.get(0)?, row.get::<_, String>(1)?))
                    })
                    .optional()?)
            })
            .await?)
    }

    /// Register enrollment image paths for a user. Returns how many were added.
    pub async fn add_images(&self, user_id: i64, paths: &[PathBuf]) -> Result<usize, StoreError> {
        let paths: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let added = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists = tx
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [user_id], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !exists {
                    return Ok(None);
                }
                {
                    let mut stmt = tx.prepare("INSERT INTO images (user_id, image_path) VALUES (?1, ?2)")?;
                    for path in &paths {
                        stmt.execute(params![user_id, path])?;
                    }
                }
                tx.commit()?;
                Ok(Some(paths.len()))
            })
            .await?;
        added.ok_or(StoreError::UnknownUser(user_id))
    }

    /// Forget every enrollment image of a user. Returns how many were removed.
    pub async fn remove_images(&self, user_id: i64) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM images WHERE user_id = ?1", [user_id])?))
            .await?)
    }

    /// Replace the office location (there is only ever one).
    pub async fn set_office_location(&self, office: &OfficeLocation) -> Result<(), StoreError> {
        let office = office.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM office_location", [])?;
                tx.execute(
                    "INSERT INTO office_location (latitude, longitude, radius_meter, resolved_address)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![office.latitude, office.longitude, office.radius_m, office.resolved_address],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Every record dated `date`, ordered by id.
    pub async fn attendance_on(&self, date: NaiveDate) -> Result<Vec<(i64, AttendanceRecord)>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, date, time, image_path, latitude, longitude, resolved_address,
                            radius_meter, location_verified, face_verified, status, confidence
                     FROM attendance WHERE date = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([date.to_string()], |row| {
                        Ok(RawAttendance {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            date: row.get(2)?,
                            time: row.get(3)?,
                            image_path: row.get(4)?,
                            latitude: row.get(5)?,
                            longitude: row.get(6)?,
                            resolved_address: row.get(7)?,
                            radius_m: row.get(8)?,
                            location_verified: row.get(9)?,
                            face_verified: row.get(10)?,
                            status: row.get(11)?,
                            confidence: row.get(12)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawAttendance::into_record).collect()
    }

    /// Insert an Absent record for every user with no record on `at`'s date.
    /// Returns how many users were marked absent.
    pub async fn sweep_absentees(&self, at: NaiveDateTime) -> Result<usize, StoreError> {
        let marked = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let radius_m: f64 = tx
                    .query_row("SELECT radius_meter FROM office_location ORDER BY id LIMIT 1", [], |row| row.get(0))
                    .optional()?
                    .unwrap_or(DEFAULT_RADIUS_M);
                let absentees: Vec<i64> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM users
                         WHERE id NOT IN (SELECT user_id FROM attendance WHERE date = ?1)
                         ORDER BY id",
                    )?;
                    let ids = stmt
                        .query_map([at.date().to_string()], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    ids
                };
                for &user_id in &absentees {
                    insert_record(&tx, &AttendanceRecord::absent(user_id, radius_m, at))?;
                }
                tx.commit()?;
                Ok(absentees.len())
            })
            .await?;
        tracing::info!(date = %at.date(), marked, "absentee sweep finished");
        Ok(marked)
    }
}

fn insert_record(conn: &rusqlite::Connection, record: &AttendanceRecord) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO attendance (user_id, date, time, image_path, latitude, longitude, resolved_address,
                                 radius_meter, location_verified, face_verified, status, confidence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.user_id,
            record.date.to_string(),
            record.time.format("%H:%M:%S").to_string(),
            record.image_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            record.coordinates.latitude,
            record.coordinates.longitude,
            record.resolved_address,
            record.radius_m,
            record.location_verified,
            record.face_verified,
            record.status.as_str(),
            f64::from(record.confidence),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Column values as stored, before parsing dates and status.
struct RawAttendance {
    id: i64,
    user_id: i64,
    date: String,
    time: String,
    image_path: Option<String>,
    latitude: f64,
    longitude: f64,
    resolved_address: String,
    radius_m: f64,
    location_verified: bool,
    face_verified: bool,
    status: String,
    confidence: f64,
}

impl RawAttendance {
    fn into_record(self) -> Result<(i64, AttendanceRecord), StoreError> {
        let corrupt = |what: &str, value: &str| StoreError::Corrupt(format!("attendance {}: {what} {value:?}", self.id));
        let date: NaiveDate = self.date.parse().map_err(|_| corrupt("date", &self.date))?;
        let time: NaiveTime = self.time.parse().map_err(|_| corrupt("time", &self.time))?;
        let status: AttendanceStatus = self.status.parse().map_err(|_| corrupt("status", &self.status))?;
        Ok((
            self.id,
            AttendanceRecord {
                user_id: self.user_id,
                date,
                time,
                status,
                face_verified: self.face_verified,
                location_verified: self.location_verified,
                confidence: self.confidence as f32,
                coordinates: Coordinates {
                    latitude: self.latitude,
                    longitude: self.longitude,
                },
                resolved_address: self.resolved_address,
                radius_m: self.radius_m,
                image_path: self.image_path.map(PathBuf::from),
            },
        ))
    }
}

#[async_trait]
impl EnrollmentSource for Store {
    async fn enrollments(&self) -> Result<Vec<Enrollment>, StoreError> {
        let rows: Vec<(i64, String, Option<String>)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT u.id, u.name, i.image_path
                     FROM users u LEFT JOIN images i ON i.user_id = u.id
                     ORDER BY u.id, i.id",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut enrollments: Vec<Enrollment> = Vec::new();
        for (user_id, name, path) in rows {
            let is_same_user = enrollments
                .last()
                .is_some_and(|e| e.identity.user_id == user_id);
            if !is_same_user {
                enrollments.push(Enrollment {
                    identity: Identity::new(user_id, name),
                    images: Vec::new(),
                });
            }
            if let (Some(path), Some(current)) = (path, enrollments.last_mut()) {
                current.images.push(PathBuf::from(path));
            }
        }
        Ok(enrollments)
    }

    async fn enrollment(&self, user_id: i64) -> Result<Option<Enrollment>, StoreError> {
        let Some(identity) = self.user(user_id).await? else {
            return Ok(None);
        };
        let images: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT image_path FROM images WHERE user_id = ?1 ORDER BY id")?;
                let paths = stmt
                    .query_map([user_id], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(paths)
            })
            .await?;
        Ok(Some(Enrollment {
            identity,
            images: images.into_iter().map(PathBuf::from).collect(),
        }))
    }
}

#[async_trait]
impl OfficeSource for Store {
    async fn office_location(&self) -> Result<Option<OfficeLocation>, StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT latitude, longitude, radius_meter, resolved_address
                         FROM office_location ORDER BY id LIMIT 1",
                        [],
                        |row| {
                            Ok(OfficeLocation {
                                latitude: row.get(0)?,
                                longitude: row.get(1)?,
                                radius_m: row.get(2)?,
                                resolved_address: row.get(3)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?)
    }
}

#[async_trait]
impl AttendanceSink for Store {
    async fn record(&self, record: &AttendanceRecord) -> Result<StoredAttendance, StoreError> {
        let record = record.clone();
        let stored = self
            .conn
            .call(move |conn| {
                let id = insert_record(conn, &record)?;
                Ok(StoredAttendance {
                    id,
                    date: record.date,
                    time: record.time,
                })
            })
            .await?;
        Ok(stored)
    }
}
