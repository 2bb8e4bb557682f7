use anyhow::{anyhow, Result};
use postgrest::Postgrest;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Published by the low-level client when the backend refuses our token.
/// The auth layer subscribes at wiring time; this module never imports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
}

#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(8);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish_expired(&self) {
        // Nobody listening is fine; the event is advisory.
        let _ = self.tx.send(SessionEvent::Expired);
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub rest_url: String,
    pub satchel_api_key: String,
    pub supabase_api_key: String,
}

impl DatabaseConfig {
    /// Creates a new database config from environment variables with an
    /// optional per-user Satchel API key (falls back to SATCHEL_API_KEY).
    pub fn from_env_with_api_key(satchel_api_key: Option<String>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut rest_url = std::env::var("SATCHEL_DATABASE_REST_URL")
            .map_err(|_| anyhow!("SATCHEL_DATABASE_REST_URL environment variable is required"))?;

        // Ensure the URL has the correct PostgREST path
        if !rest_url.ends_with("/rest/v1") {
            if rest_url.ends_with('/') {
                rest_url.push_str("rest/v1");
            } else {
                rest_url.push_str("/rest/v1");
            }
        }

        let satchel_api_key = match satchel_api_key {
            Some(key) => key,
            None => std::env::var("SATCHEL_API_KEY")
                .map_err(|_| anyhow!("SATCHEL_API_KEY environment variable is required"))?,
        };

        let supabase_api_key = std::env::var("SUPABASE_PUBLIC_API_KEY").map_err(|_| {
            anyhow!("SUPABASE_PUBLIC_API_KEY environment variable is required for Supabase access")
        })?;

        Ok(DatabaseConfig {
            rest_url,
            satchel_api_key,
            supabase_api_key,
        })
    }
}

/// Thin PostgREST wrapper shared by the sync and transport clients. All
/// responses funnel through `parse_rows` so backend error payloads surface
/// as readable errors instead of deserialization noise.
pub struct SatchelDbClient {
    config: DatabaseConfig,
    client: Option<Postgrest>,
    events: SessionEvents,
}

impl std::fmt::Debug for SatchelDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SatchelDbClient")
            .field("config", &self.config)
            .field(
                "client",
                if self.client.is_some() {
                    &"Connected"
                } else {
                    &"Disconnected"
                },
            )
            .finish()
    }
}

impl SatchelDbClient {
    pub fn new(config: DatabaseConfig, events: SessionEvents) -> Self {
        Self {
            config,
            client: None,
            events,
        }
    }

    /// Establishes a connection to the database via PostgREST
    pub fn connect(&mut self) -> Result<()> {
        let client = Postgrest::new(&self.config.rest_url)
            .insert_header("apikey", &self.config.supabase_api_key)
            .insert_header("api_key", &self.config.satchel_api_key);

        self.client = Some(client);

        Ok(())
    }

    /// Gets the PostgREST client, ensuring connection is established
    pub fn get_client(&mut self) -> Result<&Postgrest> {
        if self.client.is_none() {
            self.connect()?;
        }

        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("No PostgREST client available"))
    }

    pub fn disconnect(&mut self) {
        self.client = None;
    }

    /// Turns a PostgREST response body into typed rows, or a readable error
    /// when the backend answered with an error payload instead.
    fn parse_rows<T>(&self, context: &str, body: &str) -> Result<Vec<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        if let Ok(rows) = serde_json::from_str::<Vec<T>>(body) {
            return Ok(rows);
        }
        // Single-object responses (RPC, Accept: single) are also accepted.
        if let Ok(row) = serde_json::from_str::<T>(body) {
            return Ok(vec![row]);
        }
        if let Ok(error_response) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(message) = error_response
                .get("message")
                .or_else(|| error_response.get("error"))
            {
                if message.as_str().is_some_and(|m| m.contains("JWT")) {
                    self.events.publish_expired();
                }
                return Err(anyhow!("{} failed: {}", context, message));
            }
        }
        Err(anyhow!("{} returned unexpected format: {}", context, body))
    }

    // Plain u16 on purpose: postgrest's response type pins its own http
    // version, so naming a status type here would tie us to it.
    fn check_status(&self, context: &str, status: u16) -> Result<()> {
        if status == 401 {
            self.events.publish_expired();
            return Err(anyhow!("{} rejected: session expired", context));
        }
        Ok(())
    }

    /// Executes a query and returns the results
    pub async fn query<T>(
        &mut self,
        context: &str,
        query_builder: impl FnOnce(&Postgrest) -> postgrest::Builder,
    ) -> Result<Vec<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let client = self.get_client()?;
        let response = query_builder(client).execute().await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        self.check_status(context, status)?;
        self.parse_rows(context, &body)
    }

    /// Calls a Postgres function through the PostgREST rpc endpoint
    pub async fn rpc<T>(&mut self, function: &str, params: serde_json::Value) -> Result<T>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let client = self.get_client()?;
        let response = client.rpc(function, params.to_string()).execute().await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        self.check_status(function, status)?;

        let rows: Vec<T> = self.parse_rows(function, &body)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} returned no rows", function))
    }

    /// Inserts a row without reading anything back (fire-and-forget tables)
    pub async fn insert_only<T>(&mut self, table: &str, data: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        let json_data = serde_json::to_string(data)?;
        let client = self.get_client()?;
        let response = client.from(table).insert(&json_data).execute().await?;

        let status = response.status().as_u16();
        self.check_status(table, status)?;
        if !(200..300).contains(&status) {
            let error_text = response.text().await?;
            return Err(anyhow!("{} insert failed: HTTP {} - {}", table, status, error_text));
        }
        Ok(())
    }

    /// Updates rows matched by the filter
    pub async fn update<T>(
        &mut self,
        context: &str,
        data: &T,
        filter_builder: impl FnOnce(&Postgrest) -> postgrest::Builder,
    ) -> Result<Vec<T>>
    where
        T: for<'de> serde::Deserialize<'de> + serde::Serialize,
    {
        let json_data = serde_json::to_string(data)?;
        let client = self.get_client()?;
        let response = filter_builder(client).update(&json_data).execute().await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        self.check_status(context, status)?;
        self.parse_rows(context, &body)
    }

    /// Deletes rows matched by the filter
    pub async fn delete(
        &mut self,
        context: &str,
        filter_builder: impl FnOnce(&Postgrest) -> postgrest::Builder,
    ) -> Result<()> {
        let client = self.get_client()?;
        let response = filter_builder(client).delete().execute().await?;

        let status = response.status().as_u16();
        self.check_status(context, status)?;
        if !(200..300).contains(&status) {
            let error_text = response.text().await?;
            return Err(anyhow!(
                "{} delete failed: HTTP {} - {}",
                context,
                status,
                error_text
            ));
        }

        Ok(())
    }
}

impl Drop for SatchelDbClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
