//! Single-flight, TTL-bounded memoization for expensive metric sources.
//!
//! A [`CacheCell`] wraps one fetch function. While the stored value is younger
//! than the TTL it is returned as-is. Once stale, exactly one caller becomes the
//! fetcher; everybody else keeps getting the previous value until the fetch
//! lands. A cold cell has no previous value, so callers arriving during the
//! very first fetch wait for it instead. The blocking flavour waits at most
//! [`COLD_WAIT`] and then settles for `T::default()`, so a hung first fetch
//! strands one thread, not every caller after it.
//!
//! The in-flight flag is owned by a drop guard: a fetch that returns, errors,
//! panics or (async) is cancelled always hands the role back.

use std::future::Future;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Longest a blocking caller waits on a cold cell's first fetch.
pub const COLD_WAIT: Duration = Duration::from_secs(1);

struct Slot<T> {
    value: Option<T>,
    fetched_at: Option<Instant>,
    in_flight: bool,
}

enum Role<T> {
    Hit(T),
    Fetch,
    Wait,
}

pub struct CacheCell<T> {
    ttl: Duration,
    cold_wait: Duration,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    ready_async: Notify,
}

impl<T> std::fmt::Debug for CacheCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCell")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> CacheCell<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cold_wait: COLD_WAIT,
            slot: Mutex::new(Slot {
                value: None,
                fetched_at: None,
                in_flight: false,
            }),
            ready: Condvar::new(),
            ready_async: Notify::new(),
        }
    }

    pub fn with_cold_wait(mut self, cold_wait: Duration) -> Self {
        self.cold_wait = cold_wait;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Last stored value, without triggering a fetch.
    pub fn peek(&self) -> Option<T> {
        self.lock().value.clone()
    }

    pub async fn get_async<F, Fut>(&self, fetch: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            // Register interest before inspecting the slot so a release that
            // happens in between is not missed.
            let notified = self.ready_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let role = {
                let mut slot = self.lock();
                decide(&mut slot, self.ttl)
            };
            match role {
                Role::Hit(v) => return v,
                Role::Fetch => break,
                Role::Wait => notified.await,
            }
        }
        let guard = FlightGuard { cell: self };
        let value = fetch().await;
        guard.store(value.clone());
        value
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Default> CacheCell<T> {
    /// Blocking flavour, for providers running on the blocking pool.
    pub fn get<F: FnOnce() -> T>(&self, fetch: F) -> T {
        if let Some(v) = self.claim_blocking() {
            return v;
        }
        let guard = FlightGuard { cell: self };
        let value = fetch();
        guard.store(value.clone());
        value
    }

    /// Like [`get`](Self::get) but for fallible fetches. An error leaves the
    /// previous value untouched and is handed to the caller.
    pub fn try_get<E, F: FnOnce() -> Result<T, E>>(&self, fetch: F) -> Result<T, E> {
        if let Some(v) = self.claim_blocking() {
            return Ok(v);
        }
        let guard = FlightGuard { cell: self };
        let value = fetch()?;
        guard.store(value.clone());
        Ok(value)
    }

    /// Returns `Some` when the caller should use a stored value, `None` when it
    /// now holds the fetcher role.
    fn claim_blocking(&self) -> Option<T> {
        let deadline = Instant::now() + self.cold_wait;
        let mut slot = self.lock();
        loop {
            match decide(&mut slot, self.ttl) {
                Role::Hit(v) => return Some(v),
                Role::Fetch => return None,
                Role::Wait => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Some(T::default());
                    }
                    slot = self
                        .ready
                        .wait_timeout(slot, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

fn decide<T: Clone>(slot: &mut Slot<T>, ttl: Duration) -> Role<T> {
    if let (Some(v), Some(at)) = (&slot.value, slot.fetched_at) {
        if at.elapsed() < ttl {
            return Role::Hit(v.clone());
        }
    }
    if slot.in_flight {
        return match &slot.value {
            Some(v) => Role::Hit(v.clone()),
            None => Role::Wait,
        };
    }
    slot.in_flight = true;
    Role::Fetch
}

struct FlightGuard<'a, T: Clone> {
    cell: &'a CacheCell<T>,
}

impl<T: Clone> FlightGuard<'_, T> {
    fn store(&self, value: T) {
        let mut slot = self.cell.lock();
        slot.value = Some(value);
        slot.fetched_at = Some(Instant::now());
    }
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.lock().in_flight = false;
        self.cell.ready.notify_all();
        self.cell.ready_async.notify_waiters();
    }
}
