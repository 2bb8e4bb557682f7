use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use satchel_rs::client::TransportRemote;
use satchel_rs::location::LocationProvider;
use satchel_rs::models::{
    Bus, DriverAssignment, HeartbeatPing, LocationPing, RawLocation, Route, RouteStop,
    StopStatus, Trip, TripStatus, TripStop,
};
use satchel_rs::trip::{TripController, TripError};
use tokio::sync::mpsc;

/// # Driver Trip Flow Tests
///
/// Full-journey coverage of a morning route: load the assignment, start a
/// trip, work through the stops in order (with one skip), end the trip.
/// Location pings and heartbeats are captured by the fake backend so the
/// reporting side of the journey is asserted alongside the state machine.

struct ServerState {
    trip: Option<Trip>,
    stops: Vec<TripStop>,
    locations: Vec<LocationPing>,
    heartbeats: Vec<HeartbeatPing>,
}

struct FakeServer {
    state: StdMutex<ServerState>,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(ServerState {
                trip: None,
                stops: Vec::new(),
                locations: Vec::new(),
                heartbeats: Vec::new(),
            }),
        })
    }

    fn route_stops(route_id: i64) -> Vec<RouteStop> {
        let stop = |stop_id: i64, stop_order: i32, name: &str| RouteStop {
            stop_id,
            route_id,
            stop_order,
            name: Some(name.to_string()),
            latitude: Some(24.9),
            longitude: Some(67.1),
            student_count: 5,
        };
        vec![
            stop(21, 1, "North Gate"),
            stop(22, 2, "Clifton Bridge"),
            stop(23, 3, "Seaview Apartments"),
        ]
    }

    fn mutate_stop(
        &self,
        stop_id: i64,
        expect: StopStatus,
        next: StopStatus,
    ) -> Result<TripStop> {
        let mut state = self.state.lock().unwrap();
        let stop = state
            .stops
            .iter_mut()
            .find(|s| s.stop_id == stop_id)
            .ok_or_else(|| anyhow!("no such stop"))?;
        if stop.status != expect {
            return Err(anyhow!("transition rejected"));
        }
        stop.status = next;
        match next {
            StopStatus::Arrived => stop.arrival_time = Some(Utc::now().to_rfc3339()),
            StopStatus::Completed => stop.departure_time = Some(Utc::now().to_rfc3339()),
            _ => {}
        }
        Ok(stop.clone())
    }
}

#[async_trait]
impl TransportRemote for FakeServer {
    async fn fetch_assignment(&self) -> Result<DriverAssignment> {
        Ok(DriverAssignment {
            bus: Some(Bus {
                id: 3,
                registration: Some("KA-1207".to_string()),
                name: Some("Bus 12".to_string()),
            }),
            routes: vec![Route {
                id: 8,
                name: "Clifton Morning".to_string(),
            }],
            active_trip: self.state.lock().unwrap().trip.clone(),
        })
    }

    async fn fetch_route_stops(&self, route_id: i64) -> Result<Vec<RouteStop>> {
        Ok(Self::route_stops(route_id))
    }

    async fn fetch_trip_stops(&self, _trip_id: i64) -> Result<Vec<TripStop>> {
        Ok(self.state.lock().unwrap().stops.clone())
    }

    async fn start_trip(&self, route_id: i64) -> Result<Trip> {
        let mut state = self.state.lock().unwrap();
        if state.trip.as_ref().is_some_and(|t| t.status == TripStatus::Active) {
            return Err(anyhow!("another trip is active"));
        }
        let trip = Trip {
            id: 500,
            route_id,
            bus_id: 3,
            started_at: Some(Utc::now().to_rfc3339()),
            ended_at: None,
            status: TripStatus::Active,
        };
        state.stops = Self::route_stops(route_id)
            .iter()
            .map(TripStop::pending_from_route)
            .collect();
        state.trip = Some(trip.clone());
        Ok(trip)
    }

    async fn end_trip(&self, trip_id: i64) -> Result<Trip> {
        let mut state = self.state.lock().unwrap();
        let trip = state
            .trip
            .as_mut()
            .filter(|t| t.id == trip_id)
            .ok_or_else(|| anyhow!("no such trip"))?;
        trip.status = TripStatus::Ended;
        trip.ended_at = Some(Utc::now().to_rfc3339());
        Ok(trip.clone())
    }

    async fn arrive_at_stop(&self, _trip_id: i64, stop_id: i64) -> Result<TripStop> {
        self.mutate_stop(stop_id, StopStatus::Pending, StopStatus::Arrived)
    }

    async fn complete_stop(&self, _trip_id: i64, stop_id: i64) -> Result<TripStop> {
        self.mutate_stop(stop_id, StopStatus::Arrived, StopStatus::Completed)
    }

    async fn skip_stop(&self, _trip_id: i64, stop_id: i64) -> Result<TripStop> {
        self.mutate_stop(stop_id, StopStatus::Pending, StopStatus::Skipped)
    }

    async fn post_location(&self, ping: &LocationPing) -> Result<()> {
        self.state.lock().unwrap().locations.push(ping.clone());
        Ok(())
    }

    async fn post_heartbeat(&self, ping: &HeartbeatPing) -> Result<()> {
        self.state.lock().unwrap().heartbeats.push(ping.clone());
        Ok(())
    }
}

/// Hands out a pre-filled channel of GPS samples.
struct ScriptedGps {
    rx: StdMutex<Option<mpsc::Receiver<RawLocation>>>,
}

impl ScriptedGps {
    fn with_samples(samples: Vec<RawLocation>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(32);
        for sample in samples {
            tx.try_send(sample).unwrap();
        }
        // Dropping tx closes the stream once the samples are drained, which
        // is fine: the reporter just parks on a closed channel.
        Arc::new(Self {
            rx: StdMutex::new(Some(rx)),
        })
    }
}

impl LocationProvider for ScriptedGps {
    fn subscribe(&self) -> Result<mpsc::Receiver<RawLocation>> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("gps already subscribed"))
    }
}

fn sample(ts: i64, lat: f64) -> RawLocation {
    RawLocation {
        latitude: lat,
        longitude: 67.1,
        speed_mps: Some(8.0),
        heading: Some(90.0),
        is_mocked: false,
        timestamp: ts,
    }
}

#[tokio::test]
async fn morning_route_with_one_skip_runs_to_completion() {
    let server = FakeServer::new();
    let gps = ScriptedGps::with_samples(vec![
        sample(0, 24.900),
        sample(12_000, 24.905),
        sample(24_000, 24.910),
    ]);
    let mut controller = TripController::new(server.clone(), gps);

    let assignment = controller.load_assignment().await.unwrap().clone();
    assert!(assignment.bus.is_some());
    assert_eq!(assignment.routes.len(), 1);

    controller.start_trip(8).await.unwrap();
    assert_eq!(controller.stops().len(), 3);
    assert_eq!(controller.current_stop().unwrap().stop_id, 21);

    controller.arrive_at_stop(21).await.unwrap();
    controller.complete_stop(21).await.unwrap();

    // Nobody waiting at Clifton Bridge today.
    controller.skip_stop(22).await.unwrap();

    controller.arrive_at_stop(23).await.unwrap();
    controller.complete_stop(23).await.unwrap();
    assert_eq!(controller.progress_percent(), 100.0);

    // Give the reporter task a chance to drain the scripted samples before
    // the trip ends.
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.end_trip().await.unwrap();

    let state = server.state.lock().unwrap();
    assert_eq!(state.trip.as_ref().unwrap().status, TripStatus::Ended);
    assert_eq!(
        state
            .stops
            .iter()
            .map(|s| s.status)
            .collect::<Vec<_>>(),
        vec![
            StopStatus::Completed,
            StopStatus::Skipped,
            StopStatus::Completed
        ]
    );
    // All three samples clear the gate (12 s apart, past the time floor).
    assert_eq!(state.locations.len(), 3);
    assert!(state.locations.iter().all(|p| p.trip_id == 500));
    assert!((state.locations[0].speed_kmh - 28.8).abs() < 1e-9);
}

#[tokio::test]
async fn journey_state_is_recoverable_after_an_app_restart() {
    let server = FakeServer::new();

    {
        let gps = ScriptedGps::with_samples(Vec::new());
        let mut before = TripController::new(server.clone(), gps);
        before.load_assignment().await.unwrap();
        before.start_trip(8).await.unwrap();
        before.arrive_at_stop(21).await.unwrap();
        // The app dies here; the controller drops and tracking stops with it.
    }

    let gps = ScriptedGps::with_samples(Vec::new());
    let mut after = TripController::new(server.clone(), gps);
    after.load_assignment().await.unwrap();
    assert!(after.assignment().active_trip.is_some());

    after.resume_trip().await.unwrap();
    assert_eq!(after.current_stop().unwrap().stop_id, 21);
    assert_eq!(after.current_stop().unwrap().status, StopStatus::Arrived);

    // The journey picks up exactly where it stopped.
    after.complete_stop(21).await.unwrap();
    after.skip_stop(22).await.unwrap();
    after.skip_stop(23).await.unwrap();
    after.end_trip().await.unwrap();
    assert_eq!(after.progress_percent(), 100.0);
}

#[tokio::test]
async fn a_second_driver_session_cannot_start_over_an_active_trip() {
    let server = FakeServer::new();
    let gps = ScriptedGps::with_samples(Vec::new());
    let mut first = TripController::new(server.clone(), gps);
    first.load_assignment().await.unwrap();
    first.start_trip(8).await.unwrap();

    let gps = ScriptedGps::with_samples(Vec::new());
    let mut second = TripController::new(server.clone(), gps);
    second.load_assignment().await.unwrap();

    assert!(matches!(
        second.start_trip(8).await.unwrap_err(),
        TripError::TripAlreadyActive(500)
    ));
}
