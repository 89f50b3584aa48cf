//! Hubs keyed by session and scope, for pull transports.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::broker::MessageBroker;
use super::config::HubManagerConfig;
use super::hub::ReplayHub;
use crate::binding::{BindingRegistry, PersistHook, RegistryError, WriteOutcome};
use crate::observable::Subscription;
use crate::protocol::Envelope;
use crate::Error;

type HubKey = (String, String);

struct HubSlot {
    hub: ReplayHub,
    last_access: Instant,
}

struct ManagerInner {
    config: HubManagerConfig,
    hubs: Mutex<FxHashMap<HubKey, HubSlot>>,
    broker: Option<Arc<dyn MessageBroker>>,
    persist: Option<PersistHook>,
}

/// Owns the live [`ReplayHub`]s of a process, one per `(session, scope)`.
///
/// Hubs idle for longer than `idle_timeout` are evicted on the next access
/// or [`evict_expired`](Self::evict_expired) call; beyond `max_hubs` the
/// least recently used hub goes. Every evicted hub is closed.
///
/// With a broker, every hub relays its envelopes, and messages from other
/// nodes reach the local hubs of the same session through
/// [`ReplayHub::emit_raw`].
pub struct HubManager {
    inner: Arc<ManagerInner>,
    relay: Option<Subscription>,
}

/// Builder for [`HubManager`].
pub struct HubManagerBuilder {
    config: HubManagerConfig,
    broker: Option<Arc<dyn MessageBroker>>,
    persist: Option<PersistHook>,
}

impl HubManagerBuilder {
    /// Relays every hub's envelopes through `broker`.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Sets the persistence hook of every hub the manager creates.
    #[must_use]
    pub fn persist(mut self, hook: PersistHook) -> Self {
        self.persist = Some(hook);
        self
    }

    /// Builds the manager and subscribes it to the broker, if any.
    #[must_use]
    pub fn build(self) -> HubManager {
        let inner = Arc::new(ManagerInner {
            config: self.config,
            hubs: Mutex::new(FxHashMap::default()),
            broker: self.broker,
            persist: self.persist,
        });
        let relay = inner.broker.as_ref().map(|broker| {
            let weak: Weak<ManagerInner> = Arc::downgrade(&inner);
            broker.on_message(Arc::new(move |session: &str, message: &str| {
                if let Some(inner) = weak.upgrade() {
                    for hub in inner.hubs_of(session) {
                        hub.emit_raw(message);
                    }
                }
            }))
        });
        HubManager { inner, relay }
    }
}

impl HubManager {
    /// Creates a manager without a broker.
    #[must_use]
    pub fn new(config: HubManagerConfig) -> Self {
        Self::builder(config).build()
    }

    /// Starts building a manager.
    #[must_use]
    pub fn builder(config: HubManagerConfig) -> HubManagerBuilder {
        HubManagerBuilder {
            config,
            broker: None,
            persist: None,
        }
    }

    /// Returns the live hub for `(session, scope)`, building it from the
    /// registry `factory` returns if there is none. The factory runs without
    /// any manager lock held.
    ///
    /// # Errors
    ///
    /// Returns the factory's [`RegistryError`].
    pub fn hub<F>(&self, session: &str, scope: &str, factory: F) -> crate::Result<ReplayHub>
    where
        F: FnOnce() -> Result<BindingRegistry, RegistryError>,
    {
        if let Some(hub) = self.get(session, scope) {
            return Ok(hub);
        }
        let fresh = self.inner.create(session, factory()?);

        let now = Instant::now();
        let key: HubKey = (session.to_string(), scope.to_string());
        let mut evicted = Vec::new();
        let hub = {
            let mut hubs = self.inner.hubs.lock();
            if let Some(slot) = hubs.get_mut(&key) {
                // Lost a race with another caller; keep theirs.
                slot.last_access = now;
                evicted.push(fresh);
                slot.hub.clone()
            } else {
                hubs.insert(
                    key,
                    HubSlot {
                        hub: fresh.clone(),
                        last_access: now,
                    },
                );
                while hubs.len() > self.inner.config.max_hubs {
                    let Some(lru) = hubs
                        .iter()
                        .min_by_key(|(_, slot)| slot.last_access)
                        .map(|(key, _)| key.clone())
                    else {
                        break;
                    };
                    if let Some(slot) = hubs.remove(&lru) {
                        tracing::debug!(session = %lru.0, scope = %lru.1, "evicting least recently used hub");
                        evicted.push(slot.hub);
                    }
                }
                tracing::debug!(session, scope, "hub created");
                fresh
            }
        };

        for stale in evicted {
            stale.close();
        }
        Ok(hub)
    }

    /// Returns the live hub for `(session, scope)` and marks it accessed.
    #[must_use]
    pub fn get(&self, session: &str, scope: &str) -> Option<ReplayHub> {
        let now = Instant::now();
        for stale in self.inner.take_expired(now) {
            stale.close();
        }
        let mut hubs = self.inner.hubs.lock();
        let slot = hubs.get_mut(&(session.to_string(), scope.to_string()))?;
        slot.last_access = now;
        Some(slot.hub.clone())
    }

    /// Polls an existing hub. `None` if there is no hub for the pair.
    #[must_use]
    pub fn poll(&self, session: &str, scope: &str, since: u64) -> Option<Envelope> {
        self.get(session, scope).map(|hub| hub.poll(since))
    }

    /// Writes through an existing hub.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HubNotFound`] if there is no hub for the pair, or the
    /// hub's write error.
    pub fn set(
        &self,
        session: &str,
        scope: &str,
        key: &str,
        value: &Value,
    ) -> crate::Result<WriteOutcome> {
        let hub = self
            .get(session, scope)
            .ok_or_else(|| Error::HubNotFound {
                session: session.to_string(),
                scope: scope.to_string(),
            })?;
        hub.set(key, value)
    }

    /// Closes and removes one hub. Returns `true` if it existed.
    pub fn evict(&self, session: &str, scope: &str) -> bool {
        let removed = self
            .inner
            .hubs
            .lock()
            .remove(&(session.to_string(), scope.to_string()));
        match removed {
            Some(slot) => {
                slot.hub.close();
                true
            }
            None => false,
        }
    }

    /// Closes and removes every hub of a session. Returns how many there
    /// were.
    pub fn evict_session(&self, session: &str) -> usize {
        let removed: Vec<HubSlot> = {
            let mut hubs = self.inner.hubs.lock();
            let keys: Vec<HubKey> = hubs.keys().filter(|(s, _)| s == session).cloned().collect();
            keys.iter().filter_map(|key| hubs.remove(key)).collect()
        };
        for slot in &removed {
            slot.hub.close();
        }
        removed.len()
    }

    /// Closes and removes every hub idle for longer than the timeout.
    /// Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub(crate) fn evict_expired_at(&self, now: Instant) -> usize {
        let expired = self.inner.take_expired(now);
        for hub in &expired {
            hub.close();
        }
        expired.len()
    }

    /// Closes every hub.
    pub fn close_all(&self) {
        let drained: Vec<HubSlot> = self.inner.hubs.lock().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.hub.close();
        }
    }

    /// Number of live hubs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.hubs.lock().len()
    }

    /// Returns `true` if no hub is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.hubs.lock().is_empty()
    }

    /// Returns the manager's configuration.
    #[must_use]
    pub fn config(&self) -> &HubManagerConfig {
        &self.inner.config
    }
}

impl Default for HubManager {
    fn default() -> Self {
        Self::new(HubManagerConfig::default())
    }
}

impl Drop for HubManager {
    fn drop(&mut self) {
        self.relay.take();
        self.close_all();
    }
}

impl fmt::Debug for HubManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubManager")
            .field("hubs", &self.len())
            .field("config", &self.inner.config)
            .field("relay", &self.relay.is_some())
            .finish()
    }
}

impl ManagerInner {
    fn create(&self, session: &str, registry: BindingRegistry) -> ReplayHub {
        let mut builder = ReplayHub::builder(registry).config(self.config.replay);
        if let Some(hook) = &self.persist {
            builder = builder.persist(Arc::clone(hook));
        }
        if let Some(broker) = &self.broker {
            builder = builder.relay(Arc::clone(broker), session);
        }
        builder.build()
    }

    fn take_expired(&self, now: Instant) -> Vec<ReplayHub> {
        let timeout = self.config.idle_timeout;
        let mut hubs = self.hubs.lock();
        let expired: Vec<HubKey> = hubs
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_access) > timeout)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                let slot = hubs.remove(&key)?;
                tracing::debug!(session = %key.0, scope = %key.1, "evicting idle hub");
                Some(slot.hub)
            })
            .collect()
    }

    fn hubs_of(&self, session: &str) -> Vec<ReplayHub> {
        self.hubs
            .lock()
            .iter()
            .filter(|((s, _), _)| s == session)
            .map(|(_, slot)| slot.hub.clone())
            .collect()
    }
}
