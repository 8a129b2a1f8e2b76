//! Single-flight execution.
//!
//! Concurrent callers asking for the same key share one execution. The
//! first caller becomes the leader and spawns the work on its own task, so
//! a caller that stops waiting never cancels it. Everyone else subscribes
//! to the leader's result through a `watch` channel.
//!
//! The map entry is removed before the result is published, and also when
//! the task panics. A caller that arrives after the removal starts a new
//! flight instead of joining a finished one.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

struct Flight<V> {
    rx: watch::Receiver<Option<V>>,
    subscribers: Arc<AtomicUsize>,
}

type FlightMap<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

/// Coalesces concurrent executions per key.
pub struct SingleFlight<K, V> {
    flights: FlightMap<K, V>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `make()` unless a flight for `key` is already running, in which
    /// case waits for that flight instead. `make` is only called by the
    /// leader.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Aborted`] if the flight ended without a value.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> SyncResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (mut rx, leader) = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some(flight) => {
                    flight.subscribers.fetch_add(1, Ordering::SeqCst);
                    (flight.rx.clone(), None)
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(
                        key.clone(),
                        Flight {
                            rx: rx.clone(),
                            subscribers: Arc::new(AtomicUsize::new(1)),
                        },
                    );
                    (rx, Some(tx))
                }
            }
        };

        if let Some(tx) = leader {
            let landing = Landing {
                flights: Arc::clone(&self.flights),
                key: Some(key),
            };
            let work = make();
            tokio::spawn(async move {
                let value = work.await;
                drop(landing);
                tx.send_replace(Some(value));
            });
        }

        let value = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SyncError::Aborted)?
            .clone();
        value.ok_or(SyncError::Aborted)
    }

    /// Returns true while a flight for `key` is running.
    pub fn contains(&self, key: &K) -> bool {
        self.flights.lock().contains_key(key)
    }

    /// Number of running flights.
    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    /// Returns true when nothing is running.
    pub fn is_empty(&self) -> bool {
        self.flights.lock().is_empty()
    }

    /// Number of callers attached to the flight for `key`, the leader
    /// included. Zero when none is running.
    pub fn subscribers(&self, key: &K) -> usize {
        self.flights
            .lock()
            .get(key)
            .map_or(0, |flight| flight.subscribers.load(Ordering::SeqCst))
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}

/// Removes the flight entry when dropped, whether the work finished or
/// unwound.
struct Landing<K: Eq + Hash, V> {
    flights: FlightMap<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Drop for Landing<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flights.lock().remove(&key);
        }
    }
}
