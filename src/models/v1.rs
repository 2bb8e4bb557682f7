use native_db::{native_db, ToKey};
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

use chrono::{DateTime, Utc};

use super::serde_helpers::{deserialize_attachments, normalize_calendar_date, parse_epoch_ms};

// ===== ENUMS =====

/// Change-tracking flag on locally cached rows. `Synced` rows came from (or
/// have been acknowledged by) the server; anything else is pending push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Staff,
    Driver,
    Admin,
    Unknown,
}

impl From<&str> for UserRole {
    fn from(s: &str) -> Self {
        match s {
            "student" => UserRole::Student,
            "staff" => UserRole::Staff,
            "driver" => UserRole::Driver,
            "admin" => UserRole::Admin,
            _ => UserRole::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    NotStarted,
    Active,
    Ended,
}

impl From<&str> for TripStatus {
    fn from(s: &str) -> Self {
        match s {
            "active" => TripStatus::Active,
            "ended" => TripStatus::Ended,
            _ => TripStatus::NotStarted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopStatus {
    Pending,
    Arrived,
    Completed,
    Skipped,
}

impl StopStatus {
    /// Completed and skipped stops accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopStatus::Completed | StopStatus::Skipped)
    }
}

impl From<&str> for StopStatus {
    fn from(s: &str) -> Self {
        match s {
            "arrived" => StopStatus::Arrived,
            "completed" => StopStatus::Completed,
            "skipped" => StopStatus::Skipped,
            _ => StopStatus::Pending,
        }
    }
}

// ===== LOCALLY CACHED MODELS =====

/// A diary/homework entry mirrored from the server feed. `entry_date` is a
/// plain calendar-date string; timestamps are local epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct DiaryEntryLocal {
    #[primary_key]
    pub id: String,
    #[secondary_key]
    pub entry_date: String,
    #[secondary_key]
    pub class_section_id: String,
    pub subject_id: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub homework_due_date: Option<String>,
    pub attachments: Vec<String>,
    pub subject_name: Option<String>,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub sync_state: SyncState,
}

impl Default for DiaryEntryLocal {
    fn default() -> Self {
        Self {
            id: String::new(),
            entry_date: String::new(),
            class_section_id: String::new(),
            subject_id: None,
            title: None,
            content: String::new(),
            homework_due_date: None,
            attachments: Vec::new(),
            subject_name: None,
            created_by: None,
            created_at: 0,
            updated_at: 0,
            sync_state: SyncState::Synced,
        }
    }
}

/// Raw diary record as returned by the pull feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntryRecord {
    pub id: String,
    pub class_section_id: String,
    pub entry_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homework_due_date: Option<String>,
    #[serde(default, deserialize_with = "deserialize_attachments")]
    pub attachments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl DiaryEntryRecord {
    /// Maps the wire shape into the local cache shape, normalizing the entry
    /// date to a calendar-date string and timestamps to epoch milliseconds.
    /// Pulled records always land as `Synced`.
    pub fn into_local(self) -> DiaryEntryLocal {
        let entry_date =
            normalize_calendar_date(&self.entry_date).unwrap_or_else(|| self.entry_date.clone());
        let homework_due_date = self
            .homework_due_date
            .as_deref()
            .and_then(normalize_calendar_date);
        let created_at = self
            .created_at
            .as_deref()
            .and_then(parse_epoch_ms)
            .unwrap_or(0);
        let updated_at = self
            .updated_at
            .as_deref()
            .and_then(parse_epoch_ms)
            .unwrap_or(created_at);

        DiaryEntryLocal {
            id: self.id,
            entry_date,
            class_section_id: self.class_section_id,
            subject_id: self.subject_id,
            title: self.title,
            content: self.content,
            homework_due_date,
            attachments: self.attachments,
            subject_name: self.subject_name,
            created_by: self.created_by,
            created_at,
            updated_at,
            sync_state: SyncState::Synced,
        }
    }
}

impl From<&DiaryEntryLocal> for DiaryEntryRecord {
    fn from(local: &DiaryEntryLocal) -> Self {
        Self {
            id: local.id.clone(),
            class_section_id: local.class_section_id.clone(),
            entry_date: local.entry_date.clone(),
            subject_id: local.subject_id.clone(),
            title: local.title.clone(),
            content: local.content.clone(),
            homework_due_date: local.homework_due_date.clone(),
            attachments: local.attachments.clone(),
            subject_name: local.subject_name.clone(),
            created_by: local.created_by.clone(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Mirror of the signed-in user's profile. Exactly one row exists in the
/// cache; it is replaced wholesale on every successful pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 2, version = 1)]
#[native_db]
pub struct UserProfileLocal {
    #[primary_key]
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub role: UserRole,
    pub photo_url: Option<String>,
    pub permissions: Option<String>,
    pub class_section_id: Option<String>,
}

/// Raw profile as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfileRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_section_id: Option<String>,
}

impl UserProfileRecord {
    pub fn into_local(self) -> UserProfileLocal {
        UserProfileLocal {
            id: self.id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            display_name: self.display_name,
            role: self.role.as_deref().map(UserRole::from).unwrap_or(UserRole::Unknown),
            photo_url: self.photo_url,
            // Permissions are opaque to the client; kept serialized as-is.
            permissions: self.permissions.map(|p| p.to_string()),
            class_section_id: self.class_section_id,
        }
    }
}

/// Watermark bounding the last successfully pulled change set. One row,
/// fixed key, written only after a full pull+push cycle settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 3, version = 1)]
#[native_db]
pub struct SyncWatermark {
    #[primary_key]
    pub key: String,
    pub last_pulled_at: i64,
    pub schema_version: u32,
}

pub const WATERMARK_KEY: &str = "self";
pub const SCHEMA_VERSION: u32 = 1;

impl Default for SyncWatermark {
    fn default() -> Self {
        Self {
            key: WATERMARK_KEY.to_string(),
            last_pulled_at: 0,
            schema_version: SCHEMA_VERSION,
        }
    }
}

// ===== TRANSPORT DATA STRUCTURES =====
// Trip state is server-authoritative and held in memory only; none of these
// are persisted to the local cache.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: i64,
    pub route_id: i64,
    pub bus_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub status: TripStatus,
}

/// A stop in a route's static definition, before any trip is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStop {
    pub stop_id: i64,
    pub route_id: i64,
    pub stop_order: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub student_count: i32,
}

/// A stop instance within a running trip. `id` is unset until the server
/// materializes the instance at trip start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripStop {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub stop_id: i64,
    pub stop_order: i32,
    pub status: StopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub student_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<String>,
}

impl TripStop {
    /// Seeds a pending stop instance from the route's static definition.
    pub fn pending_from_route(stop: &RouteStop) -> Self {
        Self {
            id: None,
            stop_id: stop.stop_id,
            stop_order: stop.stop_order,
            status: StopStatus::Pending,
            latitude: stop.latitude,
            longitude: stop.longitude,
            student_count: stop.student_count,
            arrival_time: None,
            departure_time: None,
        }
    }
}

/// What the backend knows about the signed-in driver: assigned bus, the
/// routes that bus serves, and any trip already running for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DriverAssignment {
    pub bus: Option<Bus>,
    #[serde(default)]
    pub routes: Vec<Route>,
    pub active_trip: Option<Trip>,
}

// ===== LOCATION REPORTING =====

/// A sample as produced by the device location provider. Not persisted;
/// forwarded immediately or dropped by the sampling gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_mps: Option<f64>,
    pub heading: Option<f64>,
    pub is_mocked: bool,
    /// Epoch milliseconds at capture time.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPing {
    pub trip_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    pub is_mocked: bool,
    pub recorded_at: String,
}

impl LocationPing {
    /// Builds the wire ping from a raw sample. Raw velocity is m/s; a missing
    /// or non-positive reading (device noise) is reported as 0, never negative.
    pub fn from_raw(trip_id: i64, raw: &RawLocation) -> Self {
        let speed_kmh = raw
            .speed_mps
            .filter(|v| *v > 0.0)
            .map(|v| v * 3.6)
            .unwrap_or(0.0);
        let recorded_at = DateTime::<Utc>::from_timestamp_millis(raw.timestamp)
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        Self {
            trip_id,
            latitude: raw.latitude,
            longitude: raw.longitude,
            speed_kmh,
            heading: raw.heading,
            is_mocked: raw.is_mocked,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub trip_id: i64,
    pub sent_at: String,
}

impl HeartbeatPing {
    pub fn now(trip_id: i64) -> Self {
        Self {
            trip_id,
            sent_at: Utc::now().to_rfc3339(),
        }
    }
}
