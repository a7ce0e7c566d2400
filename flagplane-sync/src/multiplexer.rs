//! Sync multiplexer.
//!
//! # Caches
//!
//! ```text
//! all_flags       {"flags": <get_all("")>, "metadata": <merged>}
//! selector_flags  source -> {"flags": <that source's flags>, "metadata": <source metadata>}
//! ```
//!
//! Both are recomputed by `refill` on every [`Multiplexer::publish`]. Every
//! configured source always has an entry; a source with no flags in the
//! store holds [`EMPTY_SNAPSHOT`].
//!
//! # Delivery
//!
//! Subscribers hand in a bounded `tokio::sync::mpsc::Sender`. Publishing
//! uses `try_send`:
//! - full queue: the payload is dropped for that subscriber only; the next
//!   publish carries the complete state again
//! - closed receiver: the subscription is pruned

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use flagplane_core::{FlagMap, FlagStore, Metadata, Selector, SubscriptionId};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::SyncError;

/// Snapshot held for a configured source that has no flags in the store.
pub const EMPTY_SNAPSHOT: &str = r#"{"flags":{},"metadata":{}}"#;

/// One serialized snapshot, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub flags: String,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    flags: &'a FlagMap,
    metadata: &'a Metadata,
}

fn serialize(flags: &FlagMap, metadata: &Metadata) -> Result<String, SyncError> {
    Ok(serde_json::to_string(&Snapshot { flags, metadata })?)
}

type Subscribers = HashMap<SubscriptionId, mpsc::Sender<Payload>>;

#[derive(Debug, Default)]
struct State {
    /// Global subscribers (empty selector).
    subs: Subscribers,
    /// source -> subscribers scoped to that source
    selector_subs: HashMap<String, Subscribers>,
    all_flags: String,
    selector_flags: BTreeMap<String, String>,
}

/// Fan-out hub between the flag store and its watchers.
pub struct Multiplexer {
    store: Arc<dyn FlagStore>,
    sources: Vec<String>,
    state: RwLock<State>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Build a multiplexer over `store` and fill its caches once.
    pub fn new(store: Arc<dyn FlagStore>) -> Result<Self, SyncError> {
        let sources = store.sources().to_vec();
        let mux = Self {
            store,
            sources,
            state: RwLock::new(State::default()),
        };
        let (all_flags, selector_flags) = mux.refill()?;
        {
            let mut state = mux.write();
            state.all_flags = all_flags;
            state.selector_flags = selector_flags;
        }
        Ok(mux)
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_known(&self, source: &str) -> bool {
        self.sources.iter().any(|s| s == source)
    }

    /// Record `tx` as a subscriber and return the current snapshot.
    ///
    /// `selector` is `""` for the global view or a configured source id.
    /// The returned payload is built from the store with the same rules as
    /// `refill`, so it reflects every update committed before this call and
    /// matches what the next publish delivers when nothing changed. The
    /// caches themselves are left alone.
    pub fn register(
        &self,
        id: SubscriptionId,
        selector: &str,
        tx: mpsc::Sender<Payload>,
    ) -> Result<Payload, SyncError> {
        if !selector.is_empty() && !self.is_known(selector) {
            return Err(SyncError::UnknownSource(selector.to_owned()));
        }

        let mut state = self.write();
        let (all, metadata) = self.store.get_all(&Selector::All);
        let flags = if selector.is_empty() {
            serialize(&all, &metadata)?
        } else {
            let bucket: FlagMap = all
                .into_iter()
                .filter(|(_, flag)| flag.source == selector)
                .collect();
            self.source_snapshot(selector, &bucket)?
        };
        let payload = Payload { flags };

        tracing::debug!("subscriber {id} registered (selector {selector:?})");
        if selector.is_empty() {
            state.subs.insert(id, tx);
        } else {
            state
                .selector_subs
                .entry(selector.to_owned())
                .or_default()
                .insert(id, tx);
        }
        Ok(payload)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unregister(&self, id: &SubscriptionId, selector: &str) {
        let mut state = self.write();
        let removed = if selector.is_empty() {
            state.subs.remove(id)
        } else {
            state
                .selector_subs
                .get_mut(selector)
                .and_then(|subs| subs.remove(id))
        };
        if removed.is_some() {
            tracing::debug!("subscriber {id} unregistered (selector {selector:?})");
        }
    }

    /// Recompute every cached snapshot and push it to all subscribers.
    ///
    /// The exclusive lock is held across recomputation and fan-out. On a
    /// serialization failure neither the caches nor any subscriber is touched.
    pub fn publish(&self) -> Result<(), SyncError> {
        let mut state = self.write();

        let (all_flags, selector_flags) = self.refill()?;
        state.all_flags = all_flags;
        state.selector_flags = selector_flags;

        let State {
            subs,
            selector_subs,
            all_flags,
            selector_flags,
        } = &mut *state;

        deliver(subs, all_flags, "");
        for (source, flags) in selector_flags.iter() {
            if let Some(subs) = selector_subs.get_mut(source) {
                deliver(subs, flags, source);
            }
        }
        selector_subs.retain(|_, subs| !subs.is_empty());
        Ok(())
    }

    /// Cached snapshot for `source`; `""` returns the global snapshot.
    pub fn get_all_flags(&self, source: &str) -> Result<String, SyncError> {
        let state = self.read();
        if source.is_empty() {
            return Ok(state.all_flags.clone());
        }
        if !self.is_known(source) {
            return Err(SyncError::UnknownSource(source.to_owned()));
        }
        Ok(state
            .selector_flags
            .get(source)
            .cloned()
            .unwrap_or_else(|| EMPTY_SNAPSHOT.to_owned()))
    }

    /// Configured source ids joined with `,`, in configuration order.
    pub fn sources_as_metadata(&self) -> String {
        self.sources.join(",")
    }

    /// Live subscriptions across both registries.
    pub fn subscriber_count(&self) -> usize {
        let state = self.read();
        state.subs.len() + state.selector_subs.values().map(HashMap::len).sum::<usize>()
    }

    /// Serialize fresh snapshots without touching the caches.
    fn refill(&self) -> Result<(String, BTreeMap<String, String>), SyncError> {
        let mut selector_flags: BTreeMap<String, String> = self
            .sources
            .iter()
            .map(|source| (source.clone(), EMPTY_SNAPSHOT.to_owned()))
            .collect();

        let (all, metadata) = self.store.get_all(&Selector::All);
        let all_flags = serialize(&all, &metadata)?;

        let mut buckets: BTreeMap<String, FlagMap> = BTreeMap::new();
        for (key, flag) in all {
            buckets
                .entry(flag.source.clone())
                .or_default()
                .insert(key, flag);
        }

        for (source, flags) in buckets {
            let snapshot = self.source_snapshot(&source, &flags)?;
            selector_flags.insert(source, snapshot);
        }

        Ok((all_flags, selector_flags))
    }

    /// Per-source snapshot of `flags`, the flags the merged view attributes
    /// to `source`. No flags means [`EMPTY_SNAPSHOT`], whatever metadata the
    /// source recorded.
    fn source_snapshot(&self, source: &str, flags: &FlagMap) -> Result<String, SyncError> {
        if flags.is_empty() {
            return Ok(EMPTY_SNAPSHOT.to_owned());
        }
        serialize(flags, &self.store.metadata_for_source(source))
    }
}

/// Non-blocking send to every subscriber; closed receivers are pruned.
fn deliver(subs: &mut Subscribers, flags: &str, selector: &str) {
    subs.retain(|id, tx| {
        match tx.try_send(Payload {
            flags: flags.to_owned(),
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "subscriber {id} (selector {selector:?}) is not keeping up; payload dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("subscriber {id} (selector {selector:?}) went away; pruned");
                false
            }
        }
    });
}
