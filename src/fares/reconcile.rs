//! Consumer-side fare reconciliation.
//!
//! One [`FareReconciler`] tracks one (trip kind, vehicle) pairing for one UI
//! consumer. Triggers are debounced into a single recompute, recomputes are
//! throttled after a settlement, and the attempt counter is bounded so the loop
//! settles on a fallback even when inputs never stop changing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::NaiveDateTime;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

use super::cache::{FareCache, FareLookup};
use super::clock::Clock;
use super::compute::{quote, FareQuote, LocalPackage, TripMode, TripParams};
use super::config::ReconcileConfig;
use super::error::FareError;
use super::events::{EventBus, EventKind, FareEvent, Subscription};
use super::mirror::{FareMirror, MirroredFare};
use super::schedule::default_schedule;
use super::scheduler::{DelayedTask, PeriodicTask};
use super::vehicle::{TripKind, VehicleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Pending,
    Calculating,
    Settled,
}

/// What the displayed total was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FareBasis {
    Computed,
    Authoritative,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettledFare {
    pub vehicle_id: VehicleId,
    pub trip_kind: TripKind,
    /// The figure to display.
    pub total: f64,
    /// This consumer's own computation, when one ran.
    pub computed: Option<f64>,
    pub basis: FareBasis,
    pub quote: Option<FareQuote>,
    /// `StaleFallbackUsed` or `MaxAttemptsExceeded` when the total is an estimate.
    pub notice: Option<FareError>,
    pub settled_at_ms: u64,
}

impl SettledFare {
    pub fn is_estimate(&self) -> bool {
        self.notice.is_some()
    }
}

/// The trip configuration a reconciler follows.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTrip {
    pub trip_kind: TripKind,
    pub vehicle_id: VehicleId,
    pub params: TripParams,
    /// Switch vehicles on `cab-selected`.
    pub follow_selection: bool,
}

impl TrackedTrip {
    pub fn new(trip_kind: TripKind, vehicle_id: VehicleId) -> Self {
        Self {
            trip_kind,
            vehicle_id,
            params: TripParams::default(),
            follow_selection: true,
        }
    }

    pub fn with_params(mut self, params: TripParams) -> Self {
        self.params = params;
        self
    }

    pub fn following_selection(mut self, follow: bool) -> Self {
        self.follow_selection = follow;
        self
    }
}

/// Everything the reconciler needs from the process-wide fare objects.
#[derive(Clone)]
pub struct ReconcileDeps {
    pub cache: FareCache,
    pub bus: EventBus,
    pub mirror: FareMirror,
    pub clock: Arc<dyn Clock>,
    pub config: ReconcileConfig,
    pub runtime: Handle,
}

struct ReconciliationState {
    trip: TrackedTrip,
    phase: Phase,
    attempt: u32,
    pending: bool,
    calculating: bool,
    recalc_requested: bool,
    /// Bumped on every identity change; results from an older generation are dropped.
    generation: u64,
    last_settled_at: Option<Instant>,
    /// Set by the owner; wins over anything a sibling announces.
    parent_total: Option<f64>,
    /// Only ever holds a total announced for the current trip inputs.
    sibling_total: Option<f64>,
    last_computed: Option<f64>,
    /// The last settlement was a give-up; the reset tick recomputes.
    gave_up: bool,
    last_settled: Option<SettledFare>,
    last_sibling_event: Option<FareEvent>,
    timer: Option<DelayedTask>,
}

impl ReconciliationState {
    fn new(trip: TrackedTrip) -> Self {
        Self {
            trip,
            phase: Phase::Idle,
            attempt: 0,
            pending: false,
            calculating: false,
            recalc_requested: false,
            generation: 0,
            last_settled_at: None,
            parent_total: None,
            sibling_total: None,
            last_computed: None,
            gave_up: false,
            last_settled: None,
            last_sibling_event: None,
            timer: None,
        }
    }

    fn authoritative_total(&self) -> Option<f64> {
        self.parent_total.or(self.sibling_total)
    }
}

struct Inner {
    id: String,
    deps: ReconcileDeps,
    state: Mutex<ReconciliationState>,
    settled_tx: watch::Sender<Option<SettledFare>>,
    computations: AtomicUsize,
}

/// Per-consumer fare state machine: `Idle -> Pending -> Calculating -> Settled`.
///
/// Dropping it unsubscribes from the bus, cancels any pending recompute and
/// stops the attempt-reset tick.
pub struct FareReconciler {
    inner: Arc<Inner>,
    _subscription: Subscription,
    _reset_tick: PeriodicTask,
}

const WATCHED_EVENTS: [EventKind; 8] = [
    EventKind::FareCalculated,
    EventKind::FareCacheCleared,
    EventKind::FareDataUpdated,
    EventKind::FareCacheInvalidated,
    EventKind::CabSelected,
    EventKind::TripFaresUpdated,
    EventKind::LocalFaresUpdated,
    EventKind::AirportFaresUpdated,
];

// Totals closer than this are the same displayed fare.
const SAME_FARE_EPSILON: f64 = 0.5;

impl FareReconciler {
    /// Starts tracking `trip` and schedules the first computation.
    pub fn new(deps: ReconcileDeps, trip: TrackedTrip) -> Self {
        let (settled_tx, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            id: format!("reconciler-{}", uuid::Uuid::new_v4()),
            state: Mutex::new(ReconciliationState::new(trip)),
            settled_tx,
            computations: AtomicUsize::new(0),
            deps,
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.deps.bus.subscribe_many(&WATCHED_EVENTS, move |event| {
            if let Some(inner) = weak.upgrade() {
                on_event(&inner, event);
            }
        });

        let weak = Arc::downgrade(&inner);
        let period = Duration::from_millis(inner.deps.config.reset_interval_ms);
        let reset_tick = PeriodicTask::spawn(&inner.deps.runtime, period, move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            let resume = {
                let mut st = inner.state.lock();
                if st.attempt > 0 {
                    log::debug!("{}: attempt counter reset (was {})", inner.id, st.attempt);
                }
                st.attempt = 0;
                std::mem::take(&mut st.gave_up)
            };
            if resume {
                request(&inner, "attempt reset");
            }
            true
        });

        request(&inner, "mount");
        Self {
            inner,
            _subscription: subscription,
            _reset_tick: reset_tick,
        }
    }

    /// Publisher id carried in this reconciler's `fare-calculated` events.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn trip(&self) -> TrackedTrip {
        self.inner.state.lock().trip.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempt
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending
    }

    pub fn current(&self) -> Option<SettledFare> {
        self.inner.state.lock().last_settled.clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<SettledFare>> {
        self.inner.settled_tx.subscribe()
    }

    /// Number of computations started (each one consults the cache).
    pub fn computations(&self) -> usize {
        self.inner.computations.load(Ordering::SeqCst)
    }

    /// Last settled total from a previous session, for display before the
    /// first settlement.
    pub fn mirror_hint(&self) -> Option<MirroredFare> {
        let (kind, vehicle_id) = {
            let st = self.inner.state.lock();
            (st.trip.trip_kind, st.trip.vehicle_id.clone())
        };
        self.inner.deps.mirror.hint(kind, &vehicle_id)
    }

    pub fn select_vehicle(&self, vehicle_id: VehicleId) {
        let kind = self.inner.state.lock().trip.trip_kind;
        retarget(&self.inner, kind, vehicle_id);
    }

    pub fn set_trip_kind(&self, kind: TripKind) {
        let vehicle_id = self.inner.state.lock().trip.vehicle_id.clone();
        retarget(&self.inner, kind, vehicle_id);
    }

    pub fn set_distance(&self, distance_km: f64) {
        self.update_params("distance", |p| p.distance_km = distance_km);
    }

    pub fn set_trip_mode(&self, mode: TripMode) {
        self.update_params("trip mode", |p| p.trip_mode = mode);
    }

    pub fn set_package(&self, package: impl Into<String>) {
        let package = package.into();
        self.update_params("package", |p| p.package = Some(package));
    }

    pub fn set_duration_hours(&self, hours: Option<f64>) {
        self.update_params("duration", |p| p.duration_hours = hours);
    }

    pub fn set_schedule_times(
        &self,
        pickup: Option<NaiveDateTime>,
        return_at: Option<NaiveDateTime>,
    ) {
        self.update_params("schedule", |p| {
            p.pickup = pickup;
            p.return_at = return_at;
        });
    }

    /// Total supplied by the parent (booking summary, server quote). `None`
    /// forgets it.
    pub fn set_authoritative_total(&self, total: Option<f64>) {
        let total = total.filter(|t| t.is_finite() && *t > 0.0);
        self.inner.state.lock().parent_total = total;
        request(&self.inner, "authoritative total");
    }

    /// Requests a recompute with the current inputs.
    pub fn trigger(&self) {
        request(&self.inner, "manual");
    }

    fn update_params(&self, reason: &str, f: impl FnOnce(&mut TripParams)) {
        {
            let mut st = self.inner.state.lock();
            let before = st.trip.params.clone();
            f(&mut st.trip.params);
            if st.trip.params != before {
                st.sibling_total = None;
            }
        }
        request(&self.inner, reason);
    }
}

/// Switches the tracked pairing. A new pairing starts a fresh episode.
fn retarget(inner: &Arc<Inner>, kind: TripKind, vehicle_id: VehicleId) {
    {
        let mut st = inner.state.lock();
        if st.trip.trip_kind == kind && st.trip.vehicle_id == vehicle_id {
            drop(st);
            request(inner, "reselected");
            return;
        }
        log::debug!(
            "{}: tracking {kind}:{vehicle_id} (was {}:{})",
            inner.id,
            st.trip.trip_kind,
            st.trip.vehicle_id
        );
        st.trip.trip_kind = kind;
        st.trip.vehicle_id = vehicle_id;
        st.generation += 1;
        st.timer = None;
        st.attempt = 0;
        st.pending = false;
        st.calculating = false;
        st.recalc_requested = false;
        st.parent_total = None;
        st.sibling_total = None;
        st.last_computed = None;
        st.gave_up = false;
        st.last_settled = None;
        st.last_sibling_event = None;
        st.last_settled_at = None;
        st.phase = Phase::Idle;
    }
    request(inner, "identity change");
}

fn request(inner: &Arc<Inner>, reason: &str) {
    let mut st = inner.state.lock();
    if st.calculating {
        log::debug!("{}: {reason} while calculating, queued one more pass", inner.id);
        st.recalc_requested = true;
        return;
    }
    schedule(inner, &mut st, reason);
}

/// Arms the debounce timer unless one is already armed.
fn schedule(inner: &Arc<Inner>, st: &mut ReconciliationState, reason: &str) {
    st.pending = true;
    st.phase = Phase::Pending;
    if st.timer.is_some() {
        log::debug!("{}: {reason} coalesced into pending recompute", inner.id);
        return;
    }
    let cfg = &inner.deps.config;
    let debounce = Duration::from_millis(cfg.debounce_ms);
    let throttle = Duration::from_millis(cfg.throttle_ms);
    let delay = match st.last_settled_at {
        Some(at) => debounce.max(throttle.saturating_sub(at.elapsed())),
        None => debounce,
    };
    log::debug!(
        "{}: recompute in {}ms ({reason})",
        inner.id,
        delay.as_millis()
    );
    st.timer = Some(DelayedTask::spawn(
        &inner.deps.runtime,
        delay,
        fire(Arc::downgrade(inner), st.generation),
    ));
}

enum Step {
    Compute { trip: TrackedTrip },
    GaveUp { settled: SettledFare },
}

fn fire(weak: Weak<Inner>, generation: u64) -> BoxFuture<'static, ()> {
    async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let step = {
            let mut st = inner.state.lock();
            if st.generation != generation {
                return;
            }
            // This task is the timer; let it finish once the slot is freed.
            if let Some(timer) = st.timer.take() {
                timer.detach();
            }
            st.pending = false;
            st.attempt += 1;
            if st.attempt > inner.deps.config.max_attempts {
                let settled = fallback_fare(&inner, &st);
                log::warn!(
                    "{}: gave up after {} attempts, showing {:.0} ({:?})",
                    inner.id,
                    inner.deps.config.max_attempts,
                    settled.total,
                    settled.basis
                );
                st.phase = Phase::Settled;
                st.gave_up = true;
                st.recalc_requested = false;
                st.last_settled_at = Some(Instant::now());
                st.last_settled = Some(settled.clone());
                Step::GaveUp { settled }
            } else {
                st.calculating = true;
                st.phase = Phase::Calculating;
                Step::Compute {
                    trip: st.trip.clone(),
                }
            }
        };

        let trip = match step {
            Step::GaveUp { settled } => {
                inner.settled_tx.send_replace(Some(settled));
                return;
            }
            Step::Compute { trip } => trip,
        };

        inner.computations.fetch_add(1, Ordering::SeqCst);
        let cache = inner.deps.cache.clone();
        drop(inner);

        let lookup = cache.get(trip.trip_kind, &trip.vehicle_id, false).await;
        let computed = quote(&lookup.schedule, &trip.params);

        let Some(inner) = weak.upgrade() else {
            return;
        };
        settle(&inner, generation, &trip, lookup, computed);
    }
    .boxed()
}

fn settle(
    inner: &Arc<Inner>,
    generation: u64,
    trip: &TrackedTrip,
    lookup: FareLookup,
    computed: Result<FareQuote, FareError>,
) {
    let now_ms = inner.deps.clock.now_ms();
    let cfg = &inner.deps.config;
    let mut events = Vec::new();

    let settled = {
        let mut st = inner.state.lock();
        if st.generation != generation {
            log::debug!("{}: dropped result for a previous pairing", inner.id);
            return;
        }
        st.calculating = false;

        let q = match computed {
            Ok(q) => q,
            Err(e) => {
                log::warn!(
                    "{}: attempt {} for {}:{} failed: {e}",
                    inner.id,
                    st.attempt,
                    trip.trip_kind,
                    trip.vehicle_id
                );
                st.recalc_requested = false;
                schedule(inner, &mut st, "retry");
                return;
            }
        };

        let computed_total = q.total_price;
        let mut basis = FareBasis::Computed;
        let mut total = computed_total;
        // Sibling totals only apply to a result computed on the current inputs.
        let authoritative = if st.trip.params == trip.params {
            st.authoritative_total()
        } else {
            st.parent_total
        };
        if let Some(parent) = authoritative {
            let difference = (computed_total - parent).abs();
            if difference > cfg.difference_threshold {
                log::debug!(
                    "{}: computed {computed_total:.0} vs authoritative {parent:.0}",
                    inner.id
                );
                events.push(FareEvent::SignificantFareDifference {
                    vehicle_id: trip.vehicle_id.clone(),
                    trip_kind: trip.trip_kind,
                    computed: computed_total,
                    authoritative: parent,
                    difference,
                    timestamp: now_ms,
                });
            }
            let trusted = cfg.override_trip_kinds.contains(&trip.trip_kind)
                && difference > cfg.override_threshold;
            if !trusted {
                basis = FareBasis::Authoritative;
                total = parent;
            }
        }

        let settled = SettledFare {
            vehicle_id: trip.vehicle_id.clone(),
            trip_kind: trip.trip_kind,
            total,
            computed: Some(computed_total),
            basis,
            quote: Some(q),
            notice: lookup.notice(),
            settled_at_ms: now_ms,
        };
        events.push(FareEvent::FareCalculated {
            vehicle_id: trip.vehicle_id.clone(),
            trip_kind: trip.trip_kind,
            fare: total,
            timestamp: now_ms,
            source: Some(inner.id.clone()),
            inputs: Some(trip.params.clone()),
        });

        st.last_computed = Some(computed_total);
        st.gave_up = false;
        st.last_settled = Some(settled.clone());
        st.last_settled_at = Some(Instant::now());
        st.phase = Phase::Settled;
        if std::mem::take(&mut st.recalc_requested) {
            schedule(inner, &mut st, "queued trigger");
        }
        settled
    };

    log::debug!(
        "{}: settled {}:{} at {:.0} ({:?})",
        inner.id,
        settled.trip_kind,
        settled.vehicle_id,
        settled.total,
        settled.basis
    );
    inner
        .deps
        .mirror
        .record(settled.trip_kind, &settled.vehicle_id, settled.total, now_ms);
    inner.settled_tx.send_replace(Some(settled));
    for event in events {
        inner.deps.bus.publish(event);
    }
}

/// Best figure available without another computation: parent total, last
/// computed total, mirrored total, then the built-in schedule.
fn fallback_fare(inner: &Inner, st: &ReconciliationState) -> SettledFare {
    let trip = &st.trip;
    let total = st
        .authoritative_total()
        .or(st.last_computed)
        .or_else(|| {
            inner
                .deps
                .mirror
                .hint(trip.trip_kind, &trip.vehicle_id)
                .map(|m| m.total)
        })
        .unwrap_or_else(|| floor_total(trip));
    SettledFare {
        vehicle_id: trip.vehicle_id.clone(),
        trip_kind: trip.trip_kind,
        total,
        computed: None,
        basis: FareBasis::Fallback,
        quote: None,
        notice: Some(FareError::MaxAttemptsExceeded {
            attempts: inner.deps.config.max_attempts,
        }),
        settled_at_ms: inner.deps.clock.now_ms(),
    }
}

fn floor_total(trip: &TrackedTrip) -> f64 {
    let schedule = default_schedule(trip.trip_kind, &trip.vehicle_id);
    match quote(&schedule, &trip.params) {
        Ok(q) => q.total_price,
        Err(_) => {
            let smallest = TripParams {
                package: Some(LocalPackage::Hours4Km40.code().to_string()),
                ..trip.params.clone()
            };
            quote(&schedule, &smallest)
                .map(|q| q.total_price)
                .unwrap_or_default()
        }
    }
}

fn concerns(event: &FareEvent, trip: &TrackedTrip) -> bool {
    let kind_ok = event.trip_kind().map_or(true, |k| k == trip.trip_kind);
    let vehicle_ok = event.vehicle_id().map_or(true, |v| *v == trip.vehicle_id);
    kind_ok && vehicle_ok
}

fn on_event(inner: &Arc<Inner>, event: &FareEvent) {
    match event {
        FareEvent::CabSelected {
            vehicle_id,
            trip_kind,
            ..
        } => {
            let (follow, tracked_kind) = {
                let st = inner.state.lock();
                (st.trip.follow_selection, st.trip.trip_kind)
            };
            if follow && *trip_kind == tracked_kind {
                retarget(inner, *trip_kind, vehicle_id.clone());
            }
        }
        FareEvent::FareCalculated {
            vehicle_id,
            trip_kind,
            fare,
            source,
            inputs,
            ..
        } => {
            if source.as_deref() == Some(inner.id.as_str()) {
                return;
            }
            {
                let mut st = inner.state.lock();
                if st.trip.trip_kind != *trip_kind || st.trip.vehicle_id != *vehicle_id {
                    return;
                }
                if inputs.as_ref().is_some_and(|p| *p != st.trip.params) {
                    return;
                }
                // Re-registered handlers deliver the same event twice.
                if st.last_sibling_event.as_ref() == Some(event) {
                    return;
                }
                st.last_sibling_event = Some(event.clone());
                let same = st
                    .last_settled
                    .as_ref()
                    .is_some_and(|s| (s.total - fare).abs() < SAME_FARE_EPSILON);
                if same || !fare.is_finite() || *fare <= 0.0 {
                    return;
                }
                st.sibling_total = Some(*fare);
            }
            request(inner, "sibling fare");
        }
        _ => {
            let relevant = concerns(event, &inner.state.lock().trip);
            if relevant {
                request(inner, event.kind().as_str());
            }
        }
    }
}
