use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::client::TransportRemote;
use crate::models::{HeartbeatPing, LocationPing, RawLocation};
use crate::policy::best_effort;

/// Minimum elapsed time between forwarded samples.
pub const LOCATION_INTERVAL_FLOOR: Duration = Duration::from_secs(10);
/// Minimum distance moved between forwarded samples, in meters.
pub const LOCATION_DISTANCE_FLOOR_M: f64 = 15.0;
/// Liveness ping period, independent of location sampling.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Device GPS as an opaque collaborator: a cancellable subscription yielding
/// raw samples. A foreground permission grant is the implementor's concern.
pub trait LocationProvider: Send + Sync {
    fn subscribe(&self) -> Result<mpsc::Receiver<RawLocation>>;
}

/// Admits a sample when either floor is reached first: enough time elapsed
/// since the last forwarded sample, or enough distance moved. Keeps a
/// stationary bus from spamming the backend and a fast one from going stale.
/// Decisions use the sample's embedded timestamp, not arrival time.
pub(crate) struct SampleGate {
    min_interval_ms: i64,
    min_distance_m: f64,
    last: Option<(i64, f64, f64)>,
}

impl SampleGate {
    pub(crate) fn new(min_interval: Duration, min_distance_m: f64) -> Self {
        Self {
            min_interval_ms: min_interval.as_millis() as i64,
            min_distance_m,
            last: None,
        }
    }

    pub(crate) fn admit(&mut self, sample: &RawLocation) -> bool {
        let admitted = match self.last {
            None => true,
            Some((ts, lat, lon)) => {
                let elapsed_ms = sample.timestamp - ts;
                let moved_m = haversine_m(lat, lon, sample.latitude, sample.longitude);
                elapsed_ms >= self.min_interval_ms || moved_m >= self.min_distance_m
            }
        };
        if admitted {
            self.last = Some((sample.timestamp, sample.latitude, sample.longitude));
        }
        admitted
    }
}

/// Great-circle distance in meters.
fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Relays gated location samples and periodic heartbeats to the backend for
/// the lifetime of one trip. Every forward is best-effort: a failed post is
/// logged and dropped, never retried, never surfaced to the trip flow.
pub struct LocationReporter {
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl LocationReporter {
    pub fn start(
        remote: Arc<dyn TransportRemote>,
        provider: &dyn LocationProvider,
        trip_id: i64,
    ) -> Result<Self> {
        let mut samples = provider.subscribe()?;

        let sample_remote = remote.clone();
        let sample_task = tokio::spawn(async move {
            let mut gate = SampleGate::new(LOCATION_INTERVAL_FLOOR, LOCATION_DISTANCE_FLOOR_M);
            while let Some(raw) = samples.recv().await {
                if !gate.admit(&raw) {
                    continue;
                }
                let ping = LocationPing::from_raw(trip_id, &raw);
                let _ = best_effort("location ping", sample_remote.post_location(&ping).await);
            }
            debug!("location subscription for trip {} closed", trip_id);
        });

        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick resolves immediately; skip it so heartbeats
            // start one full period after trip start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ping = HeartbeatPing::now(trip_id);
                let _ = best_effort("heartbeat", remote.post_heartbeat(&ping).await);
            }
        });

        Ok(Self {
            tasks: vec![sample_task, heartbeat_task],
            stopped: false,
        })
    }

    /// Releases the location subscription task and the heartbeat timer.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for LocationReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
