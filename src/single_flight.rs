//! Single-flight execution keyed by content hash
//!
//! Many workers can discover the same chunk (or the same binary) at the same
//! moment. [`SingleFlight`] lets exactly one of them, the leader, run the
//! operation; every other caller for that key awaits the leader's result.
//!
//! ## Completion rules
//!
//! - The signal for a key resolves exactly once.
//! - On success the result stays in the map, so later callers get it
//!   immediately without touching the network.
//! - On failure the key is released *before* the error is published, so a
//!   retry can claim it again. Every waiter receives the same error.
//! - If the leader is cancelled, the key is released and waiters receive
//!   [`ArchiveError::Abandoned`] instead of hanging.

use crate::error::{ArchiveError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

type Outcome<V> = Option<std::result::Result<V, Arc<ArchiveError>>>;

/// Result of a single-flight call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flight<V> {
    /// The value produced by the leader
    pub value: V,
    /// Whether this caller ran the operation itself
    pub led: bool,
}

/// Concurrent map from key to a multi-waiter completion signal
pub struct SingleFlight<K, V> {
    slots: DashMap<K, watch::Receiver<Outcome<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}

/// Releases a claimed key unless the leader completed successfully
struct Claim<'a, K: Eq + Hash, V> {
    slots: &'a DashMap<K, watch::Receiver<Outcome<V>>>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Claim<'_, K, V> {
    fn keep(mut self) {
        self.key = None;
    }
}

impl<K: Eq + Hash, V> Drop for Claim<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.slots.remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` for `key` unless another caller already is (or did)
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::Shared`] carrying the leader's error, for every caller
    /// - [`ArchiveError::Abandoned`] if the leader was cancelled
    pub async fn run<F, Fut>(&self, key: &K, operation: F) -> Result<Flight<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let claim = match self.slots.entry(key.clone()) {
            Entry::Occupied(slot) => Err(slot.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Ok(tx)
            }
        };

        match claim {
            Ok(tx) => {
                let guard = Claim {
                    slots: &self.slots,
                    key: Some(key.clone()),
                };
                match operation().await {
                    Ok(value) => {
                        guard.keep();
                        tx.send_replace(Some(Ok(value.clone())));
                        Ok(Flight { value, led: true })
                    }
                    Err(err) => {
                        let shared = Arc::new(err);
                        drop(guard);
                        tx.send_replace(Some(Err(shared.clone())));
                        Err(ArchiveError::Shared(shared))
                    }
                }
            }
            Err(mut rx) => {
                trace!("Joining in-flight operation for {}", key);
                let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
                    Ok(outcome) => outcome.clone(),
                    Err(_) => return Err(ArchiveError::Abandoned(key.to_string())),
                };
                match outcome {
                    Some(Ok(value)) => Ok(Flight { value, led: false }),
                    Some(Err(err)) => Err(ArchiveError::Shared(err)),
                    None => Err(ArchiveError::Abandoned(key.to_string())),
                }
            }
        }
    }

    /// Completed value for `key`, if any
    pub fn completed(&self, key: &K) -> Option<V> {
        let slot = self.slots.get(key)?;
        let value = match &*slot.borrow() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        };
        value
    }

    /// Number of claimed or completed keys
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no key was ever claimed
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
