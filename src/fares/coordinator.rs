use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::error::{FareError, FareResult};

/// Process-wide FIFO lock for fare fetches.
///
/// While one operation holds the gate every other operation waits in arrival
/// order; release hands the gate straight to the oldest waiter.
pub struct FifoGate {
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<GatePermit>>,
}

pub struct GatePermit {
    gate: Arc<FifoGate>,
    armed: bool,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if self.armed {
            FifoGate::release(&self.gate);
        }
    }
}

impl FifoGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::default()),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub async fn acquire(self: &Arc<Self>) -> GatePermit {
        loop {
            let rx = {
                let mut st = self.state.lock();
                if !st.locked {
                    st.locked = true;
                    return GatePermit {
                        gate: self.clone(),
                        armed: true,
                    };
                }
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                log::debug!("fare fetch queued ({} waiting)", st.waiters.len());
                rx
            };
            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    fn release(gate: &Arc<FifoGate>) {
        loop {
            let next = {
                let mut st = gate.state.lock();
                match st.waiters.pop_front() {
                    Some(tx) => tx,
                    None => {
                        st.locked = false;
                        return;
                    }
                }
            };
            let permit = GatePermit {
                gate: gate.clone(),
                armed: true,
            };
            match next.send(permit) {
                Ok(()) => return,
                // Waiter went away; pass the gate to the next one.
                Err(mut permit) => permit.armed = false,
            }
        }
    }
}

type Flight<V> = Shared<BoxFuture<'static, FareResult<V>>>;
type FlightMap<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

struct FlightDone<K: Eq + Hash, V> {
    map: FlightMap<K, V>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for FlightDone<K, V> {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}

/// Single-flight on top of a shared [`FifoGate`].
///
/// Callers asking for a key that already has a flight await that flight's
/// outcome; a new flight runs on its own task so it completes (and releases
/// the gate) even if every caller stops waiting.
pub struct RequestCoordinator<K, V> {
    gate: Arc<FifoGate>,
    inflight: FlightMap<K, V>,
}

impl<K, V> Clone for RequestCoordinator<K, V> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            inflight: self.inflight.clone(),
        }
    }
}

impl<K, V> RequestCoordinator<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(gate: Arc<FifoGate>) -> Self {
        Self {
            gate,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn gate(&self) -> &Arc<FifoGate> {
        &self.gate
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub async fn run_exclusive<F, Fut>(&self, key: K, op: F) -> FareResult<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FareResult<V>> + Send + 'static,
    {
        let flight = {
            // Held across spawn + insert so the task cannot clear the entry first.
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                log::debug!("joining in-flight fare fetch for {key}");
                existing.clone()
            } else {
                let gate = self.gate.clone();
                let done = FlightDone {
                    map: self.inflight.clone(),
                    key: key.clone(),
                };
                let task = tokio::spawn(async move {
                    let _done = done;
                    let _permit = gate.acquire().await;
                    op().await
                });
                let flight: Flight<V> = async move {
                    match task.await {
                        Ok(out) => out,
                        Err(e) => Err(FareError::NetworkFailure(format!(
                            "fare fetch task failed: {e}"
                        ))),
                    }
                }
                .boxed()
                .shared();
                inflight.insert(key, flight.clone());
                flight
            }
        };
        flight.await
    }
}
