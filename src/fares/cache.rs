use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::clock::Clock;
use super::config::CacheConfig;
use super::coordinator::{FifoGate, RequestCoordinator};
use super::error::{FareError, FareResult};
use super::events::{EventBus, FareEvent};
use super::schedule::{default_schedule, FareSchedule, VEHICLE_CLASSES};
use super::transport::FareTransport;
use super::vehicle::{FareKey, TripKind, VehicleId};

/// One cached schedule. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: FareSchedule,
    pub fetched_at_ms: u64,
    pub expires_at_ms: u64,
}

impl CacheEntry {
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Where a schedule handed out by the cache came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSource {
    /// Live cache entry, no I/O.
    Cache,
    /// Fetched just now.
    Network,
    /// Fetch failed; an expired entry was used.
    Stale(FareError),
    /// Fetch failed and nothing was cached; built-in floor prices were used.
    Default(FareError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FareLookup {
    pub schedule: FareSchedule,
    pub source: ScheduleSource,
}

impl FareLookup {
    pub fn is_estimate(&self) -> bool {
        matches!(
            self.source,
            ScheduleSource::Stale(_) | ScheduleSource::Default(_)
        )
    }

    /// `StaleFallbackUsed` when the schedule is a degraded one.
    pub fn notice(&self) -> Option<FareError> {
        match &self.source {
            ScheduleSource::Stale(cause) | ScheduleSource::Default(cause) => {
                Some(FareError::stale(cause.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkLookup {
    pub schedules: Vec<(VehicleId, FareSchedule)>,
    pub source: ScheduleSource,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<FareKey, Arc<CacheEntry>>,
    last_bulk_fetch_ms: HashMap<TripKind, u64>,
}

/// Per (trip kind, vehicle) schedule cache with a stale/default fallback ladder.
///
/// All network access goes through one [`FifoGate`]: single-vehicle lookups are
/// single-flighted per key, bulk lookups per trip kind, and admin updates take
/// the gate too so a fetch that started before an update cannot land after it.
#[derive(Clone)]
pub struct FareCache {
    state: Arc<RwLock<CacheState>>,
    transport: Arc<dyn FareTransport>,
    single: RequestCoordinator<FareKey, FareLookup>,
    bulk: RequestCoordinator<TripKind, Vec<(VehicleId, FareSchedule)>>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    cfg: CacheConfig,
}

impl FareCache {
    pub fn new(
        transport: Arc<dyn FareTransport>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        cfg: CacheConfig,
    ) -> Self {
        let gate = FifoGate::new();
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            transport,
            single: RequestCoordinator::new(gate.clone()),
            bulk: RequestCoordinator::new(gate),
            bus,
            clock,
            cfg,
        }
    }

    pub fn gate(&self) -> &Arc<FifoGate> {
        self.single.gate()
    }

    pub fn peek(&self, kind: TripKind, vehicle_id: &VehicleId) -> Option<Arc<CacheEntry>> {
        let key = FareKey::new(kind, vehicle_id.clone());
        self.state.read().entries.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_entry(&self, key: &FareKey) -> Option<Arc<CacheEntry>> {
        let now = self.clock.now_ms();
        self.state
            .read()
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .cloned()
    }

    fn store(&self, key: FareKey, data: FareSchedule) {
        let now = self.clock.now_ms();
        let entry = CacheEntry {
            data,
            fetched_at_ms: now,
            expires_at_ms: now.saturating_add(self.cfg.ttl_ms()),
        };
        self.state.write().entries.insert(key, Arc::new(entry));
    }

    /// Schedule for one vehicle. Never fails: a failed fetch degrades to the
    /// last cached entry (even expired), then to built-in floor prices, and the
    /// returned source says which.
    pub async fn get(
        &self,
        kind: TripKind,
        vehicle_id: &VehicleId,
        force_refresh: bool,
    ) -> FareLookup {
        let key = FareKey::new(kind, vehicle_id.clone());
        if !force_refresh {
            if let Some(entry) = self.live_entry(&key) {
                log::debug!("fare cache hit for {key}");
                return FareLookup {
                    schedule: entry.data.clone(),
                    source: ScheduleSource::Cache,
                };
            }
        }
        log::debug!("fare cache miss for {key} (force={force_refresh})");

        let this = self.clone();
        let k = key.clone();
        let fetched = self
            .single
            .run_exclusive(key.clone(), move || async move {
                // A bulk refresh may have landed while this fetch was queued.
                if !force_refresh {
                    if let Some(entry) = this.live_entry(&k) {
                        return Ok(FareLookup {
                            schedule: entry.data.clone(),
                            source: ScheduleSource::Cache,
                        });
                    }
                }
                let schedule = this
                    .transport
                    .fetch_schedule(k.trip_kind, &k.vehicle_id)
                    .await?;
                if schedule.trip_kind() != k.trip_kind {
                    return Err(FareError::MalformedResponse(format!(
                        "expected {} schedule, got {}",
                        k.trip_kind,
                        schedule.trip_kind()
                    )));
                }
                this.store(k, schedule.clone());
                Ok(FareLookup {
                    schedule,
                    source: ScheduleSource::Network,
                })
            })
            .await;

        match fetched {
            Ok(lookup) => lookup,
            Err(e) => self.fallback(&key, e),
        }
    }

    fn fallback(&self, key: &FareKey, cause: FareError) -> FareLookup {
        if let Some(entry) = self.state.read().entries.get(key).cloned() {
            log::warn!("fare fetch for {key} failed, using cached schedule: {cause}");
            return FareLookup {
                schedule: entry.data.clone(),
                source: ScheduleSource::Stale(cause),
            };
        }
        log::warn!("fare fetch for {key} failed, using built-in schedule: {cause}");
        FareLookup {
            schedule: default_schedule(key.trip_kind, &key.vehicle_id),
            source: ScheduleSource::Default(cause),
        }
    }

    fn entries_for(&self, kind: TripKind) -> Vec<(VehicleId, FareSchedule)> {
        let mut out: Vec<(VehicleId, FareSchedule)> = self
            .state
            .read()
            .entries
            .iter()
            .filter(|(k, _)| k.trip_kind == kind)
            .map(|(k, e)| (k.vehicle_id.clone(), e.data.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn bulk_is_fresh(&self, kind: TripKind) -> bool {
        let now = self.clock.now_ms();
        self.state
            .read()
            .last_bulk_fetch_ms
            .get(&kind)
            .is_some_and(|at| now < at.saturating_add(self.cfg.bulk_ttl_ms()))
    }

    /// Every vehicle's schedule for one trip kind, for list views.
    pub async fn get_all(&self, kind: TripKind, force_refresh: bool) -> BulkLookup {
        if !force_refresh && self.bulk_is_fresh(kind) {
            log::debug!("bulk {kind} fares still fresh");
            return BulkLookup {
                schedules: self.entries_for(kind),
                source: ScheduleSource::Cache,
            };
        }

        let this = self.clone();
        let fetched = self
            .bulk
            .run_exclusive(kind, move || async move {
                let schedules = this.transport.fetch_all(kind).await?;
                let now = this.clock.now_ms();
                for (vehicle_id, schedule) in &schedules {
                    if schedule.trip_kind() == kind {
                        this.store(FareKey::new(kind, vehicle_id.clone()), schedule.clone());
                    }
                }
                this.state.write().last_bulk_fetch_ms.insert(kind, now);
                log::info!("{kind} fares refreshed ({} vehicles)", schedules.len());
                this.bus.publish(FareEvent::FareDataUpdated {
                    trip_kind: kind,
                    vehicle_id: None,
                    timestamp: now,
                });
                Ok(schedules)
            })
            .await;

        match fetched {
            Ok(schedules) => BulkLookup {
                schedules: schedules
                    .into_iter()
                    .filter(|(_, s)| s.trip_kind() == kind)
                    .collect(),
                source: ScheduleSource::Network,
            },
            Err(cause) => {
                let cached = self.entries_for(kind);
                if !cached.is_empty() {
                    log::warn!("bulk {kind} fare fetch failed, using cached schedules: {cause}");
                    return BulkLookup {
                        schedules: cached,
                        source: ScheduleSource::Stale(cause),
                    };
                }
                log::warn!("bulk {kind} fare fetch failed, using built-in schedules: {cause}");
                BulkLookup {
                    schedules: VEHICLE_CLASSES
                        .iter()
                        .map(|name| {
                            let v = VehicleId::new(name);
                            let s = default_schedule(kind, &v);
                            (v, s)
                        })
                        .collect(),
                    source: ScheduleSource::Default(cause),
                }
            }
        }
    }

    /// Drops one vehicle's entry, or every entry of `kind` when `vehicle_id` is
    /// `None`. Either way the next bulk lookup for `kind` refetches.
    pub fn invalidate(&self, kind: TripKind, vehicle_id: Option<&VehicleId>) {
        {
            let mut st = self.state.write();
            match vehicle_id {
                Some(v) => {
                    st.entries.remove(&FareKey::new(kind, v.clone()));
                }
                None => st.entries.retain(|k, _| k.trip_kind != kind),
            }
            st.last_bulk_fetch_ms.remove(&kind);
        }
        log::debug!(
            "invalidated {kind} fares for {}",
            vehicle_id.map(|v| v.as_str()).unwrap_or("all vehicles")
        );
        self.bus.publish(FareEvent::FareCacheInvalidated {
            trip_kind: kind,
            vehicle_id: vehicle_id.cloned(),
            timestamp: self.clock.now_ms(),
        });
    }

    pub fn clear_all(&self) {
        {
            let mut st = self.state.write();
            st.entries.clear();
            st.last_bulk_fetch_ms.clear();
        }
        log::info!("fare cache cleared");
        self.bus.publish(FareEvent::FareCacheCleared {
            timestamp: self.clock.now_ms(),
        });
    }

    /// Admin write of one vehicle's full schedule.
    pub async fn update_schedule(
        &self,
        vehicle_id: &VehicleId,
        schedule: FareSchedule,
    ) -> FareResult<()> {
        let kind = schedule.trip_kind();
        {
            let _permit = self.gate().acquire().await;
            self.transport.update_schedule(vehicle_id, &schedule).await?;
        }
        log::info!("{kind} fare schedule updated for {vehicle_id}");
        self.invalidate(kind, Some(vehicle_id));
        self.bus.publish(FareEvent::FareDataUpdated {
            trip_kind: kind,
            vehicle_id: Some(vehicle_id.clone()),
            timestamp: self.clock.now_ms(),
        });
        Ok(())
    }
}
