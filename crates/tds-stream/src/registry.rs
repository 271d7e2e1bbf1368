//! Subscription registry and fan-out.
//!
//! Two independent maps are kept per session:
//!
//! - `(service, symbol) → {subscriber → callback}`: who receives records.
//! - `(service, symbol)` wire set: whether the server has already been told
//!   to stream that symbol. SUBS goes out once per symbol no matter how many
//!   local subscribers attach to it later.
//!
//! Fan-out takes a read lock only long enough to clone the matching callbacks
//! and invokes them after releasing it, so slow subscribers never hold up
//! registration of other symbols.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use tds_core::Service;
use tds_core::error::{Result, TdsError};
use tracing::{debug, error};

use crate::proto::PushRecord;

/// Callback invoked synchronously, on the dispatcher task, for each record.
///
/// Must be cheap and non-blocking: it runs between frame reads.
pub type DataCallback = Arc<dyn Fn(&PushRecord) + Send + Sync>;

type SymbolKey = (Service, String);

#[derive(Default)]
struct RegistryInner {
    callbacks: AHashMap<SymbolKey, AHashMap<String, DataCallback>>,
    wired: AHashSet<SymbolKey>,
}

/// Result of a successful [`SubscriptionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Symbols registered for the subscriber, deduplicated, in request order.
    pub symbols: Vec<String>,
    /// Symbols that had no prior wire subscription and need a SUBS.
    pub new_on_wire: Vec<String>,
}

/// Thread-safe subscriber registry shared by callers and the dispatcher.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `subscriber` on every symbol.
    ///
    /// Fails with [`TdsError::SubscriberConflict`] if any `(service, symbol,
    /// subscriber)` triple already exists; the check covers all symbols before
    /// anything is inserted, so a conflict leaves the registry untouched.
    /// Symbols that were not yet on the wire are marked as such and returned
    /// in [`Registration::new_on_wire`].
    pub fn register(
        &self,
        service: &Service,
        subscriber: &str,
        symbols: &[String],
        callback: DataCallback,
    ) -> Result<Registration> {
        let mut unique: Vec<String> = Vec::with_capacity(symbols.len());
        for s in symbols {
            if !unique.contains(s) {
                unique.push(s.clone());
            }
        }

        let mut inner = self.inner.write();

        for symbol in &unique {
            let key = (service.clone(), symbol.clone());
            if inner.callbacks.get(&key).is_some_and(|subs| subs.contains_key(subscriber)) {
                return Err(TdsError::SubscriberConflict {
                    service: service.to_string(),
                    symbol: symbol.clone(),
                    subscriber: subscriber.to_string(),
                });
            }
        }

        let mut new_on_wire = Vec::new();
        for symbol in &unique {
            let key = (service.clone(), symbol.clone());
            inner
                .callbacks
                .entry(key.clone())
                .or_default()
                .insert(subscriber.to_string(), Arc::clone(&callback));
            if inner.wired.insert(key) {
                new_on_wire.push(symbol.clone());
            }
        }

        debug!(
            "[registry] {subscriber} → {service} {:?} ({} new on wire)",
            unique,
            new_on_wire.len()
        );

        Ok(Registration {
            symbols: unique,
            new_on_wire,
        })
    }

    /// Undo a [`register`](Self::register) whose SUBS never reached the wire.
    pub fn rollback(&self, service: &Service, subscriber: &str, registration: &Registration) {
        let mut inner = self.inner.write();
        for symbol in &registration.symbols {
            let key = (service.clone(), symbol.clone());
            if let Some(subs) = inner.callbacks.get_mut(&key) {
                subs.remove(subscriber);
                if subs.is_empty() {
                    inner.callbacks.remove(&key);
                }
            }
        }
        for symbol in &registration.new_on_wire {
            inner.wired.remove(&(service.clone(), symbol.clone()));
        }
    }

    /// Deliver `record` to every subscriber of its `(service, key)`.
    ///
    /// Returns the number of callbacks that completed. A panicking callback is
    /// logged and does not stop delivery to the others.
    pub fn fanout(&self, record: &PushRecord) -> usize {
        let targets: Vec<DataCallback> = {
            let inner = self.inner.read();
            match inner.callbacks.get(&(record.service.clone(), record.key.clone())) {
                Some(subs) => subs.values().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for cb in &targets {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(record))).is_ok() {
                delivered += 1;
            } else {
                error!("[registry] subscriber callback panicked on {} {}", record.service, record.key);
            }
        }
        delivered
    }

    /// Whether the wire has been told to stream `(service, symbol)`.
    pub fn is_wired(&self, service: &Service, symbol: &str) -> bool {
        self.inner.read().wired.contains(&(service.clone(), symbol.to_string()))
    }

    /// Subscriber names registered on `(service, symbol)`, sorted.
    pub fn subscribers(&self, service: &Service, symbol: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .callbacks
            .get(&(service.clone(), symbol.to_string()))
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
