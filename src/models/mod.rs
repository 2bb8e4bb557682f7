pub mod serde_helpers;
pub mod v1;

// ===== VERSIONED MODELS FOLLOWING NATIVE_DB PATTERN =====
// Following the pattern from the native_db documentation:
// https://docs.rs/native_db/latest/native_db/

pub mod data {
    // Type aliases pointing to the latest versions
    pub type DiaryEntryLocal = super::v1::DiaryEntryLocal;
    pub type DiaryEntryRecord = super::v1::DiaryEntryRecord;
    pub type UserProfileLocal = super::v1::UserProfileLocal;
    pub type UserProfileRecord = super::v1::UserProfileRecord;
    pub type SyncWatermark = super::v1::SyncWatermark;

    pub type Bus = super::v1::Bus;
    pub type Route = super::v1::Route;
    pub type Trip = super::v1::Trip;
    pub type RouteStop = super::v1::RouteStop;
    pub type TripStop = super::v1::TripStop;
    pub type DriverAssignment = super::v1::DriverAssignment;

    pub type RawLocation = super::v1::RawLocation;
    pub type LocationPing = super::v1::LocationPing;
    pub type HeartbeatPing = super::v1::HeartbeatPing;

    // Re-export versioned modules for direct access
    pub use super::v1;
}

// Re-export for convenient access at the top level
pub use data::*;

// Re-export shared enums and constants
pub use v1::{
    StopStatus, SyncState, TripStatus, UserRole, SCHEMA_VERSION, WATERMARK_KEY,
};
