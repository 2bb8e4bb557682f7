pub mod client;
pub mod db_client;
pub mod location;
pub mod models;
pub mod policy;
pub mod store;
pub mod sync;
pub mod trip;

pub use client::{DiaryRemote, SatchelClient, TransportRemote};
pub use db_client::{DatabaseConfig, SatchelDbClient, SessionEvent, SessionEvents};
pub use location::{LocationProvider, LocationReporter};
pub use store::{LocalStore, StoreEvent};
pub use sync::{SyncEngine, SyncError, SyncReport};
pub use trip::{TripController, TripError};
