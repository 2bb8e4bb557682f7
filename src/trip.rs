use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;

use crate::client::TransportRemote;
use crate::location::{LocationProvider, LocationReporter};
use crate::models::{DriverAssignment, StopStatus, Trip, TripStatus, TripStop};
use crate::policy::best_effort;

/// Trip-control failures. Precondition variants are raised before any remote
/// call; `Remote` carries a backend rejection verbatim. In both cases local
/// state is left exactly as it was.
#[derive(Debug, Error)]
pub enum TripError {
    #[error("no bus is assigned to this driver")]
    NoBusAssigned,
    #[error("route {0} is not among the assigned routes")]
    NoRouteSelected(i64),
    #[error("a trip is already active (trip {0})")]
    TripAlreadyActive(i64),
    #[error("no trip is active")]
    NoActiveTrip,
    #[error("unknown stop {0}")]
    UnknownStop(i64),
    #[error("invalid transition for stop {stop_id}: {reason}")]
    InvalidStopTransition { stop_id: i64, reason: String },
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

/// Owns the lifecycle of a single active trip and the sub-lifecycle of each
/// stop. Per stop: `Pending -> Arrived -> Completed`, with the alternate
/// terminal `Pending -> Skipped`; nothing else is legal. The backend is the
/// final arbiter of every transition — the controller validates preconditions
/// locally, then adopts the server's returned state, never an optimistic one.
pub struct TripController {
    remote: Arc<dyn TransportRemote>,
    provider: Arc<dyn LocationProvider>,
    assignment: DriverAssignment,
    trip: Option<Trip>,
    stops: Vec<TripStop>,
    started_at: Option<Instant>,
    reporter: Option<LocationReporter>,
}

impl TripController {
    pub fn new(remote: Arc<dyn TransportRemote>, provider: Arc<dyn LocationProvider>) -> Self {
        Self {
            remote,
            provider,
            assignment: DriverAssignment::default(),
            trip: None,
            stops: Vec::new(),
            started_at: None,
            reporter: None,
        }
    }

    /// Fetches the driver's bus, routes and any trip already running for
    /// that bus. Call before starting a trip; call `resume_trip` afterwards
    /// if the backend reports an active one.
    pub async fn load_assignment(&mut self) -> Result<&DriverAssignment, TripError> {
        self.assignment = self.remote.fetch_assignment().await?;
        Ok(&self.assignment)
    }

    pub fn assignment(&self) -> &DriverAssignment {
        &self.assignment
    }

    /// Re-attaches to a trip the backend reports as already active, e.g.
    /// after the app restarts mid-route.
    pub async fn resume_trip(&mut self) -> Result<i64, TripError> {
        if let Some(active) = self.active_trip_id() {
            return Err(TripError::TripAlreadyActive(active));
        }
        let trip = self
            .assignment
            .active_trip
            .clone()
            .ok_or(TripError::NoActiveTrip)?;

        let mut stops = self.remote.fetch_trip_stops(trip.id).await?;
        stops.sort_by_key(|s| s.stop_order);

        self.reporter = Some(LocationReporter::start(
            self.remote.clone(),
            self.provider.as_ref(),
            trip.id,
        )?);
        self.started_at = Some(Instant::now());
        self.stops = stops;
        let trip_id = trip.id;
        self.trip = Some(trip);
        info!("resumed active trip {}", trip_id);
        Ok(trip_id)
    }

    /// Starts a trip on the given route and begins location reporting.
    ///
    /// Preconditions are checked locally first; the remote may still refuse
    /// (another active trip raced us), in which case nothing changes locally.
    pub async fn start_trip(&mut self, route_id: i64) -> Result<i64, TripError> {
        if self.assignment.bus.is_none() {
            return Err(TripError::NoBusAssigned);
        }
        if !self.assignment.routes.iter().any(|r| r.id == route_id) {
            return Err(TripError::NoRouteSelected(route_id));
        }
        if let Some(active) = self.active_trip_id() {
            return Err(TripError::TripAlreadyActive(active));
        }
        if let Some(active) = self.assignment.active_trip.as_ref() {
            return Err(TripError::TripAlreadyActive(active.id));
        }

        let mut route_stops = self.remote.fetch_route_stops(route_id).await?;
        route_stops.sort_by_key(|s| s.stop_order);

        let trip = self.remote.start_trip(route_id).await?;

        // Prefer the server's materialized stop instances; fall back to the
        // route's static list if that fetch fails right after start.
        let mut stops = best_effort(
            "fetch trip stop instances",
            self.remote.fetch_trip_stops(trip.id).await,
        )
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            route_stops
                .iter()
                .map(TripStop::pending_from_route)
                .collect()
        });
        stops.sort_by_key(|s| s.stop_order);

        self.reporter = Some(LocationReporter::start(
            self.remote.clone(),
            self.provider.as_ref(),
            trip.id,
        )?);
        self.started_at = Some(Instant::now());
        self.stops = stops;
        let trip_id = trip.id;
        self.trip = Some(trip);
        info!("started trip {} on route {}", trip_id, route_id);
        Ok(trip_id)
    }

    /// Ends the active trip. Background tracking resources are torn down
    /// only after the backend confirms, so a remote failure never leaves an
    /// ended-locally-but-active-remotely trip.
    pub async fn end_trip(&mut self) -> Result<(), TripError> {
        let trip_id = self.active_trip_id().ok_or(TripError::NoActiveTrip)?;

        let ended = self.remote.end_trip(trip_id).await?;

        self.trip = Some(ended);
        self.assignment.active_trip = None;
        self.teardown_tracking();
        info!("ended trip {}", trip_id);
        Ok(())
    }

    /// Idempotent release of the location subscription and heartbeat timer.
    /// Also invoked when the controlling screen unmounts mid-trip.
    pub fn teardown_tracking(&mut self) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.stop();
        }
        self.reporter = None;
    }

    /// Marks arrival at a stop. Legal only on the current stop while it is
    /// still pending.
    pub async fn arrive_at_stop(&mut self, stop_id: i64) -> Result<(), TripError> {
        let trip_id = self.active_trip_id().ok_or(TripError::NoActiveTrip)?;
        let status = self.stop_status(stop_id)?;

        if status.is_terminal() {
            return Err(TripError::InvalidStopTransition {
                stop_id,
                reason: "stop is already completed or skipped".to_string(),
            });
        }
        if status == StopStatus::Arrived {
            return Err(TripError::InvalidStopTransition {
                stop_id,
                reason: "arrival was already recorded".to_string(),
            });
        }
        self.ensure_is_current(stop_id)?;

        let updated = self.remote.arrive_at_stop(trip_id, stop_id).await?;
        self.adopt_stop(updated);
        Ok(())
    }

    /// Completes a stop the driver has arrived at, recording departure and
    /// advancing the current-stop pointer.
    pub async fn complete_stop(&mut self, stop_id: i64) -> Result<(), TripError> {
        let trip_id = self.active_trip_id().ok_or(TripError::NoActiveTrip)?;
        let status = self.stop_status(stop_id)?;

        if status != StopStatus::Arrived {
            return Err(TripError::InvalidStopTransition {
                stop_id,
                reason: "stop has no recorded arrival".to_string(),
            });
        }
        self.ensure_is_current(stop_id)?;

        let updated = self.remote.complete_stop(trip_id, stop_id).await?;
        self.adopt_stop(updated);
        Ok(())
    }

    /// Skips a pending stop outright. Irreversible; the caller is expected
    /// to have confirmed with the driver before invoking this.
    pub async fn skip_stop(&mut self, stop_id: i64) -> Result<(), TripError> {
        let trip_id = self.active_trip_id().ok_or(TripError::NoActiveTrip)?;
        let status = self.stop_status(stop_id)?;

        if status != StopStatus::Pending {
            return Err(TripError::InvalidStopTransition {
                stop_id,
                reason: "only a pending stop can be skipped".to_string(),
            });
        }
        self.ensure_is_current(stop_id)?;

        let updated = self.remote.skip_stop(trip_id, stop_id).await?;
        self.adopt_stop(updated);
        Ok(())
    }

    /// Re-reads stop-by-stop state from the backend.
    pub async fn refresh_stops(&mut self) -> Result<(), TripError> {
        let trip_id = self.active_trip_id().ok_or(TripError::NoActiveTrip)?;
        let mut stops = self.remote.fetch_trip_stops(trip_id).await?;
        stops.sort_by_key(|s| s.stop_order);
        self.stops = stops;
        Ok(())
    }

    // ===== READ-ONLY DERIVATIONS =====
    // Recomputed from stop state on every call, never cached across a
    // mutation.

    pub fn trip(&self) -> Option<&Trip> {
        self.trip.as_ref()
    }

    pub fn active_trip_id(&self) -> Option<i64> {
        self.trip
            .as_ref()
            .filter(|t| t.status == TripStatus::Active)
            .map(|t| t.id)
    }

    pub fn stops(&self) -> &[TripStop] {
        &self.stops
    }

    /// The lowest-ordered stop still in a non-terminal state; the only stop
    /// eligible for arrive/complete/skip.
    pub fn current_stop(&self) -> Option<&TripStop> {
        self.stops.iter().find(|s| !s.status.is_terminal())
    }

    pub fn progress_percent(&self) -> f64 {
        if self.stops.is_empty() {
            return 0.0;
        }
        let done = self
            .stops
            .iter()
            .filter(|s| s.status.is_terminal())
            .count();
        done as f64 / self.stops.len() as f64 * 100.0
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    // ===== INTERNALS =====

    fn stop_status(&self, stop_id: i64) -> Result<StopStatus, TripError> {
        self.stops
            .iter()
            .find(|s| s.stop_id == stop_id)
            .map(|s| s.status)
            .ok_or(TripError::UnknownStop(stop_id))
    }

    fn ensure_is_current(&self, stop_id: i64) -> Result<(), TripError> {
        match self.current_stop() {
            Some(current) if current.stop_id == stop_id => Ok(()),
            _ => Err(TripError::InvalidStopTransition {
                stop_id,
                reason: "an earlier stop on the route is still open".to_string(),
            }),
        }
    }

    fn adopt_stop(&mut self, updated: TripStop) {
        if let Some(slot) = self.stops.iter_mut().find(|s| s.stop_id == updated.stop_id) {
            *slot = updated;
        }
        self.stops.sort_by_key(|s| s.stop_order);
    }
}

impl Drop for TripController {
    fn drop(&mut self) {
        self.teardown_tracking();
    }
}
