//! Fare quoting for outstation, local and airport taxi trips.
//!
//! [`FareEngine`] owns the shared cache, request coordinator, event bus and
//! settled-fare mirror; each UI consumer drives a [`FareReconciler`] built
//! from it. The crate logs through the `log` facade and leaves the backend to
//! the host.

mod engine;
pub mod fares;

pub use engine::{FareEngine, PricedTrip};
pub use fares::cache::{BulkLookup, CacheEntry, FareCache, FareLookup, ScheduleSource};
pub use fares::clock::{Clock, ManualClock, SystemClock};
pub use fares::compute::{quote, FareQuote, LocalPackage, TripMode, TripParams};
pub use fares::config::{load_or_init_config, EngineConfig};
pub use fares::error::{FareError, FareResult};
pub use fares::events::{EventBus, EventKind, FareEvent, Subscription};
pub use fares::mirror::{FareMirror, MirroredFare};
pub use fares::reconcile::{FareBasis, FareReconciler, Phase, SettledFare, TrackedTrip};
pub use fares::schedule::{
    default_schedule, AirportFareSchedule, FareSchedule, LocalFareSchedule,
    OutstationFareSchedule,
};
pub use fares::transport::{FareTransport, HttpFareTransport};
pub use fares::vehicle::{FareKey, TripKind, VehicleId};
