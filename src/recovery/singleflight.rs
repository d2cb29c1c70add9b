use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt, WeakShared};

use super::Result;

struct Flight<T: Clone> {
    id: u64,
    future: WeakShared<BoxFuture<'static, Result<T>>>,
}

/// Keyed in-flight call registry: concurrent callers of the same key share a
/// single execution and its result. The entry is dropped once the flight
/// settles, so a later call starts a fresh one.
pub struct FlightGroup<T: Clone> {
    flights: Mutex<HashMap<String, Flight<T>>>,
    next_id: AtomicU64,
}

impl<T> FlightGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `work` under `key`, or join an execution already in flight.
    /// Returns the shared result and whether this caller started the flight.
    ///
    /// The flight is driven by the callers awaiting it: the leader polls its
    /// own call inline and followers join a shared handle. The registry keeps
    /// only a weak handle, so once every caller has gone away the flight is
    /// dropped with them and anything it owns is torn down.
    pub async fn run<F>(&self, key: &str, work: F) -> (Result<T>, bool)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (future, id, leader) = {
            let mut flights = self.flights.lock().expect("flight registry lock");
            let joined = flights
                .get(key)
                .and_then(|flight| flight.future.upgrade().map(|future| (future, flight.id)));
            match joined {
                Some((future, id)) => (future, id, false),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = work.boxed().shared();
                    let weak = future
                        .downgrade()
                        .expect("a fresh shared future has not completed");
                    flights.insert(key.to_string(), Flight { id, future: weak });
                    (future, id, true)
                }
            }
        };

        let result = future.await;

        let mut flights = self.flights.lock().expect("flight registry lock");
        if flights.get(key).is_some_and(|flight| flight.id == id) {
            flights.remove(key);
        }
        (result, leader)
    }
}

impl<T> Default for FlightGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
