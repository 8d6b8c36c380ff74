//! In-process publish/subscribe for fare updates.
//!
//! Delivery is synchronous and in publish order: `publish` returns only after
//! every matching handler has run. Handlers registered more than once see an
//! event more than once; consumers that care deduplicate on `timestamp`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;

use super::compute::TripParams;
use super::vehicle::{TripKind, VehicleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    FareCalculated,
    FareCacheCleared,
    FareDataUpdated,
    FareCacheInvalidated,
    SignificantFareDifference,
    CabSelected,
    TripFaresUpdated,
    LocalFaresUpdated,
    AirportFaresUpdated,
}

impl EventKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "fare-calculated" => Some(Self::FareCalculated),
            "fare-cache-cleared" => Some(Self::FareCacheCleared),
            "fare-data-updated" => Some(Self::FareDataUpdated),
            "fare-cache-invalidated" => Some(Self::FareCacheInvalidated),
            "significant-fare-difference" => Some(Self::SignificantFareDifference),
            "cab-selected" => Some(Self::CabSelected),
            "trip-fares-updated" => Some(Self::TripFaresUpdated),
            "local-fares-updated" => Some(Self::LocalFaresUpdated),
            "airport-fares-updated" => Some(Self::AirportFaresUpdated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FareCalculated => "fare-calculated",
            Self::FareCacheCleared => "fare-cache-cleared",
            Self::FareDataUpdated => "fare-data-updated",
            Self::FareCacheInvalidated => "fare-cache-invalidated",
            Self::SignificantFareDifference => "significant-fare-difference",
            Self::CabSelected => "cab-selected",
            Self::TripFaresUpdated => "trip-fares-updated",
            Self::LocalFaresUpdated => "local-fares-updated",
            Self::AirportFaresUpdated => "airport-fares-updated",
        }
    }

    /// UI-originated "fares for this trip kind changed" signal.
    pub fn fares_updated_for(kind: TripKind) -> Self {
        match kind {
            TripKind::Outstation => Self::TripFaresUpdated,
            TripKind::Local => Self::LocalFaresUpdated,
            TripKind::Airport => Self::AirportFaresUpdated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum FareEvent {
    FareCalculated {
        vehicle_id: VehicleId,
        trip_kind: TripKind,
        fare: f64,
        timestamp: u64,
        /// Publisher id, so a consumer can ignore its own announcements.
        source: Option<String>,
        /// Trip inputs the fare was computed for, when the publisher knows them.
        inputs: Option<TripParams>,
    },
    FareCacheCleared {
        timestamp: u64,
    },
    FareDataUpdated {
        trip_kind: TripKind,
        vehicle_id: Option<VehicleId>,
        timestamp: u64,
    },
    FareCacheInvalidated {
        trip_kind: TripKind,
        vehicle_id: Option<VehicleId>,
        timestamp: u64,
    },
    SignificantFareDifference {
        vehicle_id: VehicleId,
        trip_kind: TripKind,
        computed: f64,
        authoritative: f64,
        difference: f64,
        timestamp: u64,
    },
    CabSelected {
        vehicle_id: VehicleId,
        trip_kind: TripKind,
        timestamp: u64,
    },
    TripFaresUpdated {
        vehicle_id: Option<VehicleId>,
        timestamp: u64,
    },
    LocalFaresUpdated {
        vehicle_id: Option<VehicleId>,
        timestamp: u64,
    },
    AirportFaresUpdated {
        vehicle_id: Option<VehicleId>,
        timestamp: u64,
    },
}

impl FareEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::FareCalculated { .. } => EventKind::FareCalculated,
            Self::FareCacheCleared { .. } => EventKind::FareCacheCleared,
            Self::FareDataUpdated { .. } => EventKind::FareDataUpdated,
            Self::FareCacheInvalidated { .. } => EventKind::FareCacheInvalidated,
            Self::SignificantFareDifference { .. } => EventKind::SignificantFareDifference,
            Self::CabSelected { .. } => EventKind::CabSelected,
            Self::TripFaresUpdated { .. } => EventKind::TripFaresUpdated,
            Self::LocalFaresUpdated { .. } => EventKind::LocalFaresUpdated,
            Self::AirportFaresUpdated { .. } => EventKind::AirportFaresUpdated,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::FareCalculated { timestamp, .. }
            | Self::FareCacheCleared { timestamp }
            | Self::FareDataUpdated { timestamp, .. }
            | Self::FareCacheInvalidated { timestamp, .. }
            | Self::SignificantFareDifference { timestamp, .. }
            | Self::CabSelected { timestamp, .. }
            | Self::TripFaresUpdated { timestamp, .. }
            | Self::LocalFaresUpdated { timestamp, .. }
            | Self::AirportFaresUpdated { timestamp, .. } => *timestamp,
        }
    }

    /// Trip kind the event is scoped to; `None` means it concerns every kind.
    pub fn trip_kind(&self) -> Option<TripKind> {
        match self {
            Self::FareCalculated { trip_kind, .. }
            | Self::FareDataUpdated { trip_kind, .. }
            | Self::FareCacheInvalidated { trip_kind, .. }
            | Self::SignificantFareDifference { trip_kind, .. }
            | Self::CabSelected { trip_kind, .. } => Some(*trip_kind),
            Self::TripFaresUpdated { .. } => Some(TripKind::Outstation),
            Self::LocalFaresUpdated { .. } => Some(TripKind::Local),
            Self::AirportFaresUpdated { .. } => Some(TripKind::Airport),
            Self::FareCacheCleared { .. } => None,
        }
    }

    /// Vehicle the event is scoped to; `None` means every vehicle.
    pub fn vehicle_id(&self) -> Option<&VehicleId> {
        match self {
            Self::FareCalculated { vehicle_id, .. }
            | Self::SignificantFareDifference { vehicle_id, .. }
            | Self::CabSelected { vehicle_id, .. } => Some(vehicle_id),
            Self::FareDataUpdated { vehicle_id, .. }
            | Self::FareCacheInvalidated { vehicle_id, .. }
            | Self::TripFaresUpdated { vehicle_id, .. }
            | Self::LocalFaresUpdated { vehicle_id, .. }
            | Self::AirportFaresUpdated { vehicle_id, .. } => vehicle_id.as_ref(),
            Self::FareCacheCleared { .. } => None,
        }
    }

    pub fn fares_updated(kind: TripKind, vehicle_id: Option<VehicleId>, timestamp: u64) -> Self {
        match kind {
            TripKind::Outstation => Self::TripFaresUpdated {
                vehicle_id,
                timestamp,
            },
            TripKind::Local => Self::LocalFaresUpdated {
                vehicle_id,
                timestamp,
            },
            TripKind::Airport => Self::AirportFaresUpdated {
                vehicle_id,
                timestamp,
            },
        }
    }
}

pub type Handler = Arc<dyn Fn(&FareEvent) + Send + Sync>;

struct Registration {
    id: u64,
    kinds: Vec<EventKind>,
    handler: Handler,
}

struct BusInner {
    next_id: AtomicU64,
    handlers: RwLock<Vec<Registration>>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&FareEvent) + Send + Sync + 'static,
    {
        self.subscribe_many(&[kind], handler)
    }

    pub fn subscribe_many<F>(&self, kinds: &[EventKind], handler: F) -> Subscription
    where
        F: Fn(&FareEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push(Registration {
            id,
            kinds: kinds.to_vec(),
            handler: Arc::new(handler),
        });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn publish(&self, event: FareEvent) {
        let kind = event.kind();
        // Snapshot first: handlers may publish or (un)subscribe re-entrantly.
        let targets: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .iter()
            .filter(|r| r.kinds.contains(&kind))
            .map(|r| r.handler.clone())
            .collect();
        log::debug!("publish {} to {} handler(s)", kind.as_str(), targets.len());
        for handler in targets {
            handler(&event);
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<BusInner>,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(bus) = self.bus.upgrade() {
            bus.handlers.write().retain(|r| r.id != id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn calculated(fare: f64, timestamp: u64) -> FareEvent {
        FareEvent::FareCalculated {
            vehicle_id: VehicleId::new("sedan"),
            trip_kind: TripKind::Outstation,
            fare,
            timestamp,
            source: None,
            inputs: None,
        }
    }

    #[test]
    fn handlers_see_events_in_publish_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe(EventKind::FareCalculated, move |e| {
            sink.lock().push(e.timestamp());
        });

        bus.publish(calculated(4450.0, 1));
        bus.publish(calculated(4460.0, 2));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn delivery_is_filtered_by_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe_many(
            &[EventKind::FareCacheCleared, EventKind::FareCacheInvalidated],
            move |e| sink.lock().push(e.kind()),
        );

        bus.publish(calculated(1.0, 1));
        bus.publish(FareEvent::FareCacheCleared { timestamp: 2 });
        bus.publish(FareEvent::FareCacheInvalidated {
            trip_kind: TripKind::Local,
            vehicle_id: None,
            timestamp: 3,
        });
        assert_eq!(
            *seen.lock(),
            vec![EventKind::FareCacheCleared, EventKind::FareCacheInvalidated]
        );
    }

    #[test]
    fn dropping_or_unsubscribing_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let a = bus.subscribe(EventKind::FareCacheCleared, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let b = bus.subscribe(EventKind::FareCacheCleared, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(FareEvent::FareCacheCleared { timestamp: 1 });
        a.unsubscribe();
        bus.publish(FareEvent::FareCacheCleared { timestamp: 2 });
        drop(b);
        bus.publish(FareEvent::FareCacheCleared { timestamp: 3 });
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_publish_and_subscribe_reentrantly() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _log = bus.subscribe_many(
            &[EventKind::FareCalculated, EventKind::SignificantFareDifference],
            move |e| sink.lock().push(e.kind().as_str()),
        );
        let inner_bus = bus.clone();
        let late = Arc::new(Mutex::new(Vec::new()));
        let late_sink = late.clone();
        let _relay = bus.subscribe(EventKind::FareCalculated, move |e| {
            let FareEvent::FareCalculated {
                vehicle_id,
                trip_kind,
                fare,
                timestamp,
                ..
            } = e
            else {
                return;
            };
            inner_bus.publish(FareEvent::SignificantFareDifference {
                vehicle_id: vehicle_id.clone(),
                trip_kind: *trip_kind,
                computed: *fare,
                authoritative: 0.0,
                difference: *fare,
                timestamp: *timestamp,
            });
            late_sink.lock().push(inner_bus.subscribe(EventKind::FareCacheCleared, |_| {}));
        });

        bus.publish(calculated(100.0, 1));
        assert_eq!(
            *seen.lock(),
            vec!["fare-calculated", "significant-fare-difference"]
        );
        assert_eq!(bus.subscriber_count(), 3);
        late.lock().clear();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn event_names_round_trip() {
        for name in [
            "fare-calculated",
            "fare-cache-cleared",
            "fare-data-updated",
            "fare-cache-invalidated",
            "significant-fare-difference",
            "cab-selected",
            "trip-fares-updated",
            "local-fares-updated",
            "airport-fares-updated",
        ] {
            assert_eq!(EventKind::from_str(name).map(|k| k.as_str()), Some(name));
        }
        assert_eq!(EventKind::from_str("price-changed"), None);
    }
}
