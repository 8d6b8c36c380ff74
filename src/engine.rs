use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::fares::cache::{FareCache, ScheduleSource};
use crate::fares::clock::{Clock, SystemClock};
use crate::fares::compute::{quote, FareQuote, TripParams};
use crate::fares::config::{load_or_init_config, EngineConfig};
use crate::fares::error::{FareError, FareResult};
use crate::fares::events::{EventBus, FareEvent};
use crate::fares::mirror::{open_mirror_dir, FareMirror};
use crate::fares::reconcile::{FareReconciler, ReconcileDeps, TrackedTrip};
use crate::fares::transport::{FareTransport, HttpFareTransport};
use crate::fares::vehicle::{TripKind, VehicleId};

/// A quote together with how trustworthy its schedule was.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedTrip {
    pub vehicle_id: VehicleId,
    pub quote: FareQuote,
    pub source: ScheduleSource,
    /// `StaleFallbackUsed` when the schedule was a degraded one.
    pub notice: Option<FareError>,
}

/// The process-wide fare objects: one bus, one cache (and with it one
/// coordinator), one mirror. Consumers borrow them through this handle.
pub struct FareEngine {
    config_path: Option<PathBuf>,
    config: EngineConfig,
    bus: EventBus,
    cache: FareCache,
    mirror: FareMirror,
    clock: Arc<dyn Clock>,
    runtime: Handle,
}

impl FareEngine {
    /// Loads (or creates) `config_path`, opens the mirror under `data_dir` and
    /// wires the HTTP transport. Must run inside a tokio runtime.
    pub fn build(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<Self> {
        let config = load_or_init_config(&config_path)?;
        let mirror = if config.mirror.persistent {
            open_mirror_dir(data_dir)?
        } else {
            FareMirror::in_memory()
        };
        let transport = HttpFareTransport::new(config.api.clone())?;
        log::info!(
            "fare engine ready (api {}, mirror {})",
            config.api.base_url,
            if mirror.is_persistent() { "persistent" } else { "session" }
        );
        let mut engine =
            Self::with_transport(config, Arc::new(transport), Arc::new(SystemClock), mirror)?;
        engine.config_path = Some(config_path);
        Ok(engine)
    }

    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn FareTransport>,
        clock: Arc<dyn Clock>,
        mirror: FareMirror,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current()?;
        let bus = EventBus::new();
        let cache = FareCache::new(transport, bus.clone(), clock.clone(), config.cache.clone());
        Ok(Self {
            config_path: None,
            config,
            bus,
            cache,
            mirror,
            clock,
            runtime,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The TOML file the config came from; `None` for injected configs.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &FareCache {
        &self.cache
    }

    pub fn mirror(&self) -> &FareMirror {
        &self.mirror
    }

    pub fn reconcile_deps(&self) -> ReconcileDeps {
        ReconcileDeps {
            cache: self.cache.clone(),
            bus: self.bus.clone(),
            mirror: self.mirror.clone(),
            clock: self.clock.clone(),
            config: self.config.reconcile.clone(),
            runtime: self.runtime.clone(),
        }
    }

    pub fn reconciler(&self, trip: TrackedTrip) -> FareReconciler {
        FareReconciler::new(self.reconcile_deps(), trip)
    }

    /// One-off quote, outside any reconciliation episode.
    pub async fn quote(
        &self,
        kind: TripKind,
        vehicle_id: &VehicleId,
        params: &TripParams,
    ) -> FareResult<PricedTrip> {
        let lookup = self.cache.get(kind, vehicle_id, false).await;
        let q = quote(&lookup.schedule, params)?;
        Ok(PricedTrip {
            vehicle_id: vehicle_id.clone(),
            quote: q,
            notice: lookup.notice(),
            source: lookup.source,
        })
    }

    /// Quotes every vehicle of one trip kind, for a cab-options list.
    pub async fn quote_all(
        &self,
        kind: TripKind,
        params: &TripParams,
    ) -> FareResult<Vec<PricedTrip>> {
        let bulk = self.cache.get_all(kind, false).await;
        let notice = match &bulk.source {
            ScheduleSource::Stale(cause) | ScheduleSource::Default(cause) => {
                Some(FareError::stale(cause.clone()))
            }
            _ => None,
        };
        bulk.schedules
            .into_iter()
            .map(|(vehicle_id, schedule)| -> FareResult<PricedTrip> {
                Ok(PricedTrip {
                    vehicle_id,
                    quote: quote(&schedule, params)?,
                    source: bulk.source.clone(),
                    notice: notice.clone(),
                })
            })
            .collect()
    }

    /// UI signal: the user picked a cab.
    pub fn select_cab(&self, kind: TripKind, vehicle_id: VehicleId) {
        self.bus.publish(FareEvent::CabSelected {
            vehicle_id,
            trip_kind: kind,
            timestamp: self.clock.now_ms(),
        });
    }

    /// UI signal: fares for `kind` changed (for one vehicle, or all of them).
    pub fn announce_fares_updated(&self, kind: TripKind, vehicle_id: Option<VehicleId>) {
        self.bus
            .publish(FareEvent::fares_updated(kind, vehicle_id, self.clock.now_ms()));
    }

    pub fn flush(&self) {
        self.mirror.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fares::clock::ManualClock;
    use crate::fares::events::EventKind;
    use crate::fares::test_support::{outstation, record_events, ScriptedTransport};

    fn engine(transport: Arc<ScriptedTransport>) -> FareEngine {
        FareEngine::with_transport(
            EngineConfig::default(),
            transport,
            Arc::new(ManualClock::new(0)),
            FareMirror::in_memory(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn build_writes_default_config_and_opens_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("fares.toml");
        let engine = FareEngine::build(config_path.clone(), tmp.path().join("data")).unwrap();

        assert!(config_path.exists());
        assert_eq!(engine.config_path(), Some(config_path.as_path()));
        assert_eq!(engine.config(), &EngineConfig::default());
        assert!(engine.mirror().is_persistent());
        assert!(tmp.path().join("data").join("sled").exists());
    }

    #[tokio::test]
    async fn quote_reports_the_schedule_source() {
        let transport = ScriptedTransport::new().with("sedan", outstation(4200.0, 14.0));
        let engine = engine(transport);
        assert!(engine.config_path().is_none());
        let params = TripParams {
            distance_km: 150.0,
            ..TripParams::default()
        };

        let priced = engine
            .quote(TripKind::Outstation, &VehicleId::new("Sedan"), &params)
            .await
            .unwrap();
        assert_eq!(priced.quote.total_price, 4450.0);
        assert_eq!(priced.source, ScheduleSource::Network);
        assert!(priced.notice.is_none());
    }

    #[tokio::test]
    async fn quote_all_prices_every_listed_vehicle() {
        let transport = ScriptedTransport::new()
            .with("sedan", outstation(4200.0, 14.0))
            .with("ertiga", outstation(5000.0, 15.0));
        let engine = engine(transport);
        let params = TripParams {
            distance_km: 200.0,
            ..TripParams::default()
        };

        let list = engine.quote_all(TripKind::Outstation, &params).await.unwrap();
        let totals: Vec<(String, f64)> = list
            .iter()
            .map(|p| (p.vehicle_id.to_string(), p.quote.total_price))
            .collect();
        assert_eq!(
            totals,
            vec![
                ("ertiga".to_string(), 5000.0 + 100.0 * 15.0 + 250.0),
                ("sedan".to_string(), 4200.0 + 100.0 * 14.0 + 250.0),
            ]
        );
    }

    #[tokio::test]
    async fn ui_signals_are_published_on_the_bus() {
        let engine = engine(ScriptedTransport::new());
        let (seen, _sub) = record_events(
            engine.bus(),
            &[EventKind::CabSelected, EventKind::AirportFaresUpdated],
        );

        engine.select_cab(TripKind::Local, VehicleId::new("Innova"));
        engine.announce_fares_updated(TripKind::Airport, None);

        let kinds: Vec<EventKind> = seen.lock().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![EventKind::CabSelected, EventKind::AirportFaresUpdated]
        );
        assert_eq!(
            seen.lock()[0].vehicle_id(),
            Some(&VehicleId::new("innova_crysta"))
        );
    }
}
