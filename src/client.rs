use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db_client::{DatabaseConfig, SatchelDbClient, SessionEvents};
use crate::models::{
    DiaryEntryLocal, DiaryEntryRecord, DriverAssignment, HeartbeatPing, LocationPing, RouteStop,
    Trip, TripStop, UserProfileRecord,
};

/// Remote side of the diary sync protocol. The sync engine only ever talks
/// to this trait, so tests can drive it with an in-process fake.
#[async_trait]
pub trait DiaryRemote: Send + Sync {
    /// Returns every diary record updated after the given watermark (epoch
    /// milliseconds), optionally scoped to one class section.
    async fn pull_entries_since(
        &self,
        updated_since: i64,
        class_section_id: Option<&str>,
    ) -> Result<Vec<DiaryEntryRecord>>;

    async fn fetch_profile(&self) -> Result<UserProfileRecord>;

    async fn create_entry(&self, entry: &DiaryEntryLocal) -> Result<()>;
    async fn update_entry(&self, entry: &DiaryEntryLocal) -> Result<()>;
    async fn delete_entry(&self, id: &str) -> Result<()>;
}

/// Remote side of the trip/transport protocol. The backend is the final
/// arbiter of every transition; these calls return its updated state.
#[async_trait]
pub trait TransportRemote: Send + Sync {
    async fn fetch_assignment(&self) -> Result<DriverAssignment>;
    async fn fetch_route_stops(&self, route_id: i64) -> Result<Vec<RouteStop>>;
    async fn fetch_trip_stops(&self, trip_id: i64) -> Result<Vec<TripStop>>;

    async fn start_trip(&self, route_id: i64) -> Result<Trip>;
    async fn end_trip(&self, trip_id: i64) -> Result<Trip>;

    async fn arrive_at_stop(&self, trip_id: i64, stop_id: i64) -> Result<TripStop>;
    async fn complete_stop(&self, trip_id: i64, stop_id: i64) -> Result<TripStop>;
    async fn skip_stop(&self, trip_id: i64, stop_id: i64) -> Result<TripStop>;

    async fn post_location(&self, ping: &LocationPing) -> Result<()>;
    async fn post_heartbeat(&self, ping: &HeartbeatPing) -> Result<()>;
}

/// PostgREST-backed implementation of both remote contracts.
pub struct SatchelClient {
    db: Mutex<SatchelDbClient>,
    events: SessionEvents,
}

impl SatchelClient {
    /// Builds a client from environment configuration with the given API key.
    pub fn new(api_key: String) -> Result<Self> {
        let config = DatabaseConfig::from_env_with_api_key(Some(api_key))?;
        Ok(Self::with_config(config))
    }

    pub fn with_config(config: DatabaseConfig) -> Self {
        let events = SessionEvents::new();
        let db = SatchelDbClient::new(config, events.clone());
        Self {
            db: Mutex::new(db),
            events,
        }
    }

    /// Event bus the auth layer subscribes to for session expiry.
    pub fn session_events(&self) -> &SessionEvents {
        &self.events
    }

    fn rfc3339_from_ms(ms: i64) -> String {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .to_rfc3339()
    }
}

#[async_trait]
impl DiaryRemote for SatchelClient {
    async fn pull_entries_since(
        &self,
        updated_since: i64,
        class_section_id: Option<&str>,
    ) -> Result<Vec<DiaryEntryRecord>> {
        let since = Self::rfc3339_from_ms(updated_since);
        let scope = class_section_id.map(str::to_string);
        let mut db = self.db.lock().await;
        db.query("diary_entries", |client| {
            let mut builder = client
                .from("diary_entries")
                .select("*")
                .gt("updated_at", &since)
                .order("updated_at.asc");
            if let Some(section) = &scope {
                builder = builder.eq("class_section_id", section);
            }
            builder
        })
        .await
    }

    async fn fetch_profile(&self) -> Result<UserProfileRecord> {
        let mut db = self.db.lock().await;
        db.rpc("get_my_profile", serde_json::json!({})).await
    }

    async fn create_entry(&self, entry: &DiaryEntryLocal) -> Result<()> {
        let record = DiaryEntryRecord::from(entry);
        let mut db = self.db.lock().await;
        db.insert_only("diary_entries", &record).await
    }

    async fn update_entry(&self, entry: &DiaryEntryLocal) -> Result<()> {
        let record = DiaryEntryRecord::from(entry);
        let id = entry.id.clone();
        let mut db = self.db.lock().await;
        db.update("diary_entries", &record, |client| {
            client.from("diary_entries").eq("id", &id)
        })
        .await?;
        Ok(())
    }

    async fn delete_entry(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let mut db = self.db.lock().await;
        db.delete("diary_entries", |client| {
            client.from("diary_entries").eq("id", &id)
        })
        .await
    }
}

#[async_trait]
impl TransportRemote for SatchelClient {
    async fn fetch_assignment(&self) -> Result<DriverAssignment> {
        let mut db = self.db.lock().await;
        db.rpc("get_driver_assignment", serde_json::json!({})).await
    }

    async fn fetch_route_stops(&self, route_id: i64) -> Result<Vec<RouteStop>> {
        let mut db = self.db.lock().await;
        db.query("route_stops", |client| {
            client
                .from("route_stops")
                .select("*")
                .eq("route_id", route_id.to_string())
                .order("stop_order.asc")
        })
        .await
    }

    async fn fetch_trip_stops(&self, trip_id: i64) -> Result<Vec<TripStop>> {
        let mut db = self.db.lock().await;
        db.query("trip_stops", |client| {
            client
                .from("trip_stops")
                .select("*")
                .eq("trip_id", trip_id.to_string())
                .order("stop_order.asc")
        })
        .await
    }

    async fn start_trip(&self, route_id: i64) -> Result<Trip> {
        let mut db = self.db.lock().await;
        db.rpc("start_trip", serde_json::json!({ "route_id": route_id }))
            .await
    }

    async fn end_trip(&self, trip_id: i64) -> Result<Trip> {
        let mut db = self.db.lock().await;
        db.rpc("end_trip", serde_json::json!({ "trip_id": trip_id }))
            .await
    }

    async fn arrive_at_stop(&self, trip_id: i64, stop_id: i64) -> Result<TripStop> {
        let mut db = self.db.lock().await;
        db.rpc(
            "arrive_at_stop",
            serde_json::json!({ "trip_id": trip_id, "stop_id": stop_id }),
        )
        .await
    }

    async fn complete_stop(&self, trip_id: i64, stop_id: i64) -> Result<TripStop> {
        let mut db = self.db.lock().await;
        db.rpc(
            "complete_stop",
            serde_json::json!({ "trip_id": trip_id, "stop_id": stop_id }),
        )
        .await
    }

    async fn skip_stop(&self, trip_id: i64, stop_id: i64) -> Result<TripStop> {
        let mut db = self.db.lock().await;
        db.rpc(
            "skip_stop",
            serde_json::json!({ "trip_id": trip_id, "stop_id": stop_id }),
        )
        .await
    }

    async fn post_location(&self, ping: &LocationPing) -> Result<()> {
        let mut db = self.db.lock().await;
        db.insert_only("trip_locations", ping).await
    }

    async fn post_heartbeat(&self, ping: &HeartbeatPing) -> Result<()> {
        let mut db = self.db.lock().await;
        db.insert_only("trip_heartbeats", ping).await
    }
}
