use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{FareError, FareResult};
use super::events::{EventBus, EventKind, FareEvent, Subscription};
use super::schedule::{FareSchedule, OutstationFareSchedule};
use super::transport::FareTransport;
use super::vehicle::{TripKind, VehicleId};

/// In-memory transport with call counters and a failure switch.
#[derive(Default)]
pub struct ScriptedTransport {
    schedules: Mutex<HashMap<(TripKind, VehicleId), FareSchedule>>,
    pub fetches: AtomicUsize,
    pub bulk_fetches: AtomicUsize,
    pub updates: Mutex<Vec<(VehicleId, FareSchedule)>>,
    failing: AtomicBool,
    delay_ms: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(self: Arc<Self>, vehicle: &str, schedule: FareSchedule) -> Arc<Self> {
        self.put(vehicle, schedule);
        self
    }

    pub fn put(&self, vehicle: &str, schedule: FareSchedule) {
        self.schedules
            .lock()
            .insert((schedule.trip_kind(), VehicleId::new(vehicle)), schedule);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay_ms(&self, ms: usize) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn bulk_fetch_count(&self) -> usize {
        self.bulk_fetches.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> FareResult<()> {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(FareError::NetworkFailure("scripted outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FareTransport for ScriptedTransport {
    async fn fetch_schedule(
        &self,
        kind: TripKind,
        vehicle_id: &VehicleId,
    ) -> FareResult<FareSchedule> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        self.schedules
            .lock()
            .get(&(kind, vehicle_id.clone()))
            .cloned()
            .ok_or_else(|| FareError::NoScheduleFound {
                trip_kind: kind,
                vehicle_id: vehicle_id.clone(),
            })
    }

    async fn fetch_all(&self, kind: TripKind) -> FareResult<Vec<(VehicleId, FareSchedule)>> {
        self.bulk_fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        let mut out: Vec<(VehicleId, FareSchedule)> = self
            .schedules
            .lock()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, v), s)| (v.clone(), s.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn update_schedule(
        &self,
        vehicle_id: &VehicleId,
        schedule: &FareSchedule,
    ) -> FareResult<()> {
        self.pause().await?;
        self.updates
            .lock()
            .push((vehicle_id.clone(), schedule.clone()));
        self.schedules
            .lock()
            .insert((schedule.trip_kind(), vehicle_id.clone()), schedule.clone());
        Ok(())
    }
}

pub fn outstation(base: f64, per_km: f64) -> FareSchedule {
    FareSchedule::Outstation(OutstationFareSchedule {
        base_price: base,
        price_per_km: per_km,
        round_trip_base_price: base,
        round_trip_price_per_km: per_km,
        driver_allowance: 250.0,
        night_halt_charge: 700.0,
    })
}

/// Records every event of the given kinds, in delivery order.
pub fn record_events(
    bus: &EventBus,
    kinds: &[EventKind],
) -> (Arc<Mutex<Vec<FareEvent>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = bus.subscribe_many(kinds, move |e| sink.lock().push(e.clone()));
    (seen, sub)
}
