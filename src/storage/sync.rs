//! Concurrency primitives shared by the stores
//!
//! - [`WriteChain`]: FIFO single-writer chain; a chained call starts only
//!   once every call chained before it has settled
//! - [`ReadGate`]: caps the number of outstanding reads, queueing the rest
//! - [`CreationQueue`]: single-flight keyed by path; the first caller does
//!   the work, later callers park their payload for it to flush

use crate::storage::error::{StorageError, StorageResult};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};

/// Serializes mutating operations in arrival order.
///
/// Backed by tokio's fair mutex, so waiters are served first-in first-out
/// and an operation's suspension points never interleave with another's.
#[derive(Debug, Default)]
pub struct WriteChain {
    lock: AsyncMutex<()>,
    queued: AtomicUsize,
}

impl WriteChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` after every previously chained operation has finished
    pub async fn run<F, T>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        self.queued.fetch_add(1, Ordering::AcqRel);
        let _turn = self.lock.lock().await;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        op.await
    }

    /// Wait until every write chained before this call has settled
    pub async fn barrier(&self) {
        drop(self.lock.lock().await);
    }

    /// Operations waiting for their turn
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

/// Bounds the number of simultaneously outstanding reads.
///
/// Reads past the limit wait on the semaphore's FIFO backlog and are let
/// through one at a time as earlier reads complete.
#[derive(Debug)]
pub struct ReadGate {
    permits: Semaphore,
    limit: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ReadGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Semaphore::new(limit),
            limit,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub async fn run<F, T>(&self, read: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| StorageError::Lock(format!("read gate closed: {}", e)))?;

        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        let _slot = InFlightGuard {
            counter: &self.in_flight,
        };

        read.await
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of reads ever observed in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A payload parked behind an in-flight operation.
///
/// The waiter is resolved with the number of the unit (block, slot) that
/// absorbed its payload. Dropping a `Pending` fails the waiter.
pub struct Pending<P> {
    pub payload: P,
    pub done: oneshot::Sender<StorageResult<u64>>,
}

impl<P> Pending<P> {
    /// Tell the waiting caller how its payload fared
    pub fn resolve(self, result: StorageResult<u64>) {
        // The waiter may have gone away; nothing to report to then
        let _ = self.done.send(result);
    }
}

/// Outcome of trying to start an operation for a key
pub enum Claim<P> {
    /// This caller owns the flight and must eventually release it;
    /// the payload is handed back
    Leader(P),
    /// Someone else is in flight; the payload was queued
    Queued(oneshot::Receiver<StorageResult<u64>>),
}

/// Single-flight coordination keyed by `K`, with queued payloads `P`
pub struct CreationQueue<K, P> {
    flights: Mutex<HashMap<K, Vec<Pending<P>>>>,
}

impl<K: Eq + Hash + Clone, P> Default for CreationQueue<K, P> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, P> CreationQueue<K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self, key: &K) -> StorageResult<bool> {
        Ok(self.flights.lock()?.contains_key(key))
    }

    /// Become the leader for `key`, or queue `payload` behind the current one
    pub fn claim(&self, key: &K, payload: P) -> StorageResult<Claim<P>> {
        let mut flights = self.flights.lock()?;
        match flights.get_mut(key) {
            Some(queue) => {
                let (done, waiter) = oneshot::channel();
                queue.push(Pending { payload, done });
                Ok(Claim::Queued(waiter))
            }
            None => {
                flights.insert(key.clone(), Vec::new());
                Ok(Claim::Leader(payload))
            }
        }
    }

    /// Take everything queued so far, keeping the flight open
    pub fn take(&self, key: &K) -> StorageResult<Vec<Pending<P>>> {
        let mut flights = self.flights.lock()?;
        Ok(flights
            .get_mut(key)
            .map(std::mem::take)
            .unwrap_or_default())
    }

    /// Close the flight if nothing is queued. Returns `false` if work arrived.
    pub fn release_if_idle(&self, key: &K) -> StorageResult<bool> {
        let mut flights = self.flights.lock()?;
        let idle = flights.get(key).map(|queue| queue.is_empty()).unwrap_or(true);
        if idle {
            flights.remove(key);
        }
        Ok(idle)
    }

    /// Close the flight and fail every queued payload
    pub fn abort(&self, key: &K, reason: &str) {
        let queued = match self.flights.lock() {
            Ok(mut flights) => flights.remove(key).unwrap_or_default(),
            Err(e) => {
                tracing::error!("Creation queue poisoned during abort: {}", e);
                return;
            }
        };
        for pending in queued {
            pending.resolve(Err(StorageError::CreationFailed(reason.to_string())));
        }
    }
}

/// Await a queued payload's outcome
pub async fn wait_queued(waiter: oneshot::Receiver<StorageResult<u64>>) -> StorageResult<u64> {
    waiter.await.map_err(|_| {
        StorageError::CreationFailed("in-flight creation dropped its queue".to_string())
    })?
}
