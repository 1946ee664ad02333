//! Single-flight coordination for cache misses.
//!
//! The first caller to miss on a key receives a [`CacheClaim`]; concurrent
//! callers for the same key wait on a watch channel until the claim is
//! fulfilled or dropped.

use super::store::CacheStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// The value published to waiters; `None` while the claim is pending.
type Flight = Option<Vec<u8>>;

/// What a waiter observed when its wait ended.
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// The claimant published a value.
    Fulfilled(Vec<u8>),
    /// The claim was dropped; the caller should try to claim again.
    Abandoned,
}

/// Registry of keys currently being computed.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    flights: DashMap<String, watch::Sender<Flight>>,
}

/// Result of trying to become the claimant for a key.
pub(crate) enum Admission {
    /// The caller now owns the claim.
    Claimed,
    /// Another caller owns it; wait on this receiver.
    Wait(watch::Receiver<Flight>),
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a claim for `key` unless one exists.
    pub(crate) fn admit(&self, key: &str) -> Admission {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => Admission::Wait(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (tx, _rx) = watch::channel(None);
                vacant.insert(tx);
                Admission::Claimed
            }
        }
    }

    /// Publishes a value to every waiter and releases the claim.
    pub(crate) fn complete(&self, key: &str, value: Vec<u8>) {
        if let Some((_, tx)) = self.flights.remove(key) {
            tx.send_replace(Some(value));
        }
    }

    /// Releases the claim without a value, waking waiters.
    pub(crate) fn abandon(&self, key: &str) {
        self.flights.remove(key);
    }

    pub(crate) fn keys(&self) -> HashSet<String> {
        self.flights.iter().map(|f| f.key().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }
}

/// Waits for the claimant of a key to finish.
pub(crate) async fn wait(mut rx: watch::Receiver<Flight>) -> WaitOutcome {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value
            .as_ref()
            .map_or(WaitOutcome::Abandoned, |v| WaitOutcome::Fulfilled(v.clone())),
        Err(_) => WaitOutcome::Abandoned,
    }
}

/// The outcome of [`CacheStore::get`].
#[derive(Debug)]
pub enum CacheLookup {
    /// The cached value.
    Hit(Vec<u8>),
    /// Nothing cached; the caller must compute the value and fulfil the claim.
    Miss(CacheClaim),
}

impl CacheLookup {
    /// Returns the value of a hit.
    #[must_use]
    pub fn hit(self) -> Option<Vec<u8>> {
        match self {
            Self::Hit(v) => Some(v),
            Self::Miss(_) => None,
        }
    }

    /// Returns true for a hit.
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Exclusive right to compute the value for a missing key.
///
/// Dropping the claim without calling [`CacheClaim::fulfil`] wakes waiting
/// callers; one of them becomes the next claimant.
#[must_use = "dropping a claim abandons it"]
pub struct CacheClaim {
    key: String,
    store: CacheStore,
    done: bool,
}

impl CacheClaim {
    pub(crate) fn new(key: String, store: CacheStore) -> Self {
        Self {
            key,
            store,
            done: false,
        }
    }

    /// The claimed key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stores the computed value and hands it to every waiter.
    ///
    /// A zero `ttl` uses the store's default.
    pub fn fulfil(mut self, value: Vec<u8>, ttl: Duration, tags: BTreeSet<String>) {
        self.done = true;
        self.store.insert_entry(&self.key, value.clone(), ttl, tags);
        self.store.in_flight().complete(&self.key, value);
    }

    /// Releases the claim without storing anything.
    pub fn abandon(mut self) {
        self.done = true;
        self.store.in_flight().abandon(&self.key);
    }
}

impl Drop for CacheClaim {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!(key = %self.key, "Cache claim dropped without a value");
            self.store.in_flight().abandon(&self.key);
        }
    }
}

impl fmt::Debug for CacheClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClaim")
            .field("key", &self.key)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_waiter_receives_value() {
        let flights = InFlight::new();
        assert!(matches!(flights.admit("k"), Admission::Claimed));
        let Admission::Wait(rx) = flights.admit("k") else {
            panic!("second admission should wait");
        };
        let waiter = tokio::spawn(wait(rx));
        flights.complete("k", vec![7]);
        match waiter.await.unwrap() {
            WaitOutcome::Fulfilled(v) => assert_eq!(v, vec![7]),
            WaitOutcome::Abandoned => panic!("expected value"),
        }
        assert_eq!(flights.len(), 0);
    }

    #[tokio::test]
    async fn test_abandon_wakes_waiter() {
        let flights = InFlight::new();
        let _ = flights.admit("k");
        let Admission::Wait(rx) = flights.admit("k") else {
            panic!("second admission should wait");
        };
        let waiter = tokio::spawn(wait(rx));
        flights.abandon("k");
        assert!(matches!(waiter.await.unwrap(), WaitOutcome::Abandoned));
        assert!(matches!(flights.admit("k"), Admission::Claimed));
    }
}
