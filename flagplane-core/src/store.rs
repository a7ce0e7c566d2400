//! Indexed, concurrency-safe flag store.
//!
//! # Table layout
//!
//! ```text
//! BTreeMap<(flag_set_id, key), Flag>
//! ```
//!
//! One ordered table serves all three access patterns:
//! - exact `(key, flag_set_id)` lookup
//! - flag-set scans (range over the `flag_set_id` prefix)
//! - key-only lookup in the sentinel flag-set
//!
//! The table, per-source metadata and per-source selectors live behind a
//! single `RwLock`. Every `update` runs under the write guard, so a reader
//! observes either the whole batch or none of it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
use crate::types::{
    Flag, Metadata, Notification, NotificationType, Notifications, SENTINEL_FLAG_SET,
};

/// Flags keyed by flag key, as returned by [`FlagStore::get_all`].
pub type FlagMap = BTreeMap<String, Flag>;

// ---------------------------------------------------------------------------
// 1. Selector
// ---------------------------------------------------------------------------

/// Filter applied by [`FlagStore::get_all`].
///
/// Parsed from a string:
/// - `""` matches every flag
/// - `flagSetId=<id>` matches one flag-set
/// - `source=<id>` matches flags last written by one source
/// - anything else matches flags whose recorded selector equals it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selector {
    #[default]
    All,
    FlagSet(String),
    Source(String),
    Named(String),
}

impl Selector {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Selector::All;
        }
        if let Some(id) = raw.strip_prefix("flagSetId=") {
            return Selector::FlagSet(id.to_owned());
        }
        if let Some(id) = raw.strip_prefix("source=") {
            return Selector::Source(id.to_owned());
        }
        Selector::Named(raw.to_owned())
    }

    pub fn matches(&self, flag: &Flag) -> bool {
        match self {
            Selector::All => true,
            Selector::FlagSet(id) => flag.flag_set_id == *id,
            Selector::Source(id) => flag.source == *id,
            Selector::Named(name) => flag.selector == *name,
        }
    }
}

impl From<&str> for Selector {
    fn from(raw: &str) -> Self {
        Selector::parse(raw)
    }
}

// ---------------------------------------------------------------------------
// 2. Store contract
// ---------------------------------------------------------------------------

/// Result of a reconciling update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub notifications: Notifications,
    /// A flag was implicitly deleted; views derived from "all flags" must be
    /// rebuilt rather than patched.
    pub resync_required: bool,
}

impl UpdateOutcome {
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }
}

/// Narrow interface over a flag store backend.
///
/// Read paths never fail: absence is reported as `None` or as an empty map.
pub trait FlagStore: Send + Sync {
    /// Point lookup in the sentinel (unscoped) flag-set.
    fn get(&self, key: &str) -> Option<Flag>;

    /// Point lookup in an explicit flag-set.
    fn get_for_flag_set(&self, key: &str, flag_set_id: &str) -> Option<Flag>;

    /// Snapshot of every flag matching `selector`, plus metadata.
    ///
    /// The result is an owned copy; later writes never alter it.
    fn get_all(&self, selector: &Selector) -> (FlagMap, Metadata);

    /// Selector recorded for the flag's source at its last update.
    fn selector_for_flag(&self, flag: &Flag) -> String;

    /// Apply a full-replacement batch for one `(source, selector)` pair.
    fn update(
        &self,
        source: &str,
        selector: &str,
        flags: FlagMap,
        metadata: Metadata,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Copy of the metadata last recorded for `source`.
    fn metadata_for_source(&self, source: &str) -> Metadata;

    /// Known sources in priority order (later entries win).
    fn sources(&self) -> &[String];

    /// Does `incoming` take priority over `stored`?
    fn has_priority(&self, stored: &str, incoming: &str) -> bool {
        has_priority(self.sources(), stored, incoming)
    }
}

/// Source priority comparison over an ordered source list.
///
/// Walks the list from the end; whichever of the two appears last wins.
/// Equal or unknown sources resolve in favour of `incoming`.
pub fn has_priority(sources: &[String], stored: &str, incoming: &str) -> bool {
    if stored == incoming {
        return true;
    }
    for source in sources.iter().rev() {
        if source == stored {
            return false;
        }
        if source == incoming {
            return true;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// 3. In-memory backend
// ---------------------------------------------------------------------------

type FlagId = (String, String);

#[derive(Debug, Default)]
struct State {
    flags: BTreeMap<FlagId, Flag>,
    /// source -> last-seen selector
    source_details: BTreeMap<String, String>,
    metadata_per_source: BTreeMap<String, Metadata>,
}

impl State {
    fn flag_set<'a>(&'a self, flag_set_id: &'a str) -> impl Iterator<Item = &'a Flag> + 'a {
        self.flags
            .range((flag_set_id.to_owned(), String::new())..)
            .take_while(move |((set, _), _)| set == flag_set_id)
            .map(|(_, flag)| flag)
    }

    /// Keys present in exactly one source pass through; shared keys are dropped.
    fn merged_metadata(&self) -> Metadata {
        let mut merged = Metadata::new();
        let mut conflicting = BTreeSet::new();
        for per_source in self.metadata_per_source.values() {
            for (key, value) in per_source {
                if merged.contains_key(key) {
                    conflicting.insert(key.clone());
                } else {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged.retain(|key, _| !conflicting.contains(key));
        merged
    }
}

/// Process-scoped in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    sources: Vec<String>,
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create a store for a fixed, ordered list of sources.
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FlagStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Flag> {
        self.get_for_flag_set(key, SENTINEL_FLAG_SET)
    }

    fn get_for_flag_set(&self, key: &str, flag_set_id: &str) -> Option<Flag> {
        self.read()
            .flags
            .get(&(flag_set_id.to_owned(), key.to_owned()))
            .cloned()
    }

    fn get_all(&self, selector: &Selector) -> (FlagMap, Metadata) {
        let state = self.read();
        let candidates: Box<dyn Iterator<Item = &Flag> + '_> = match selector {
            Selector::FlagSet(id) => Box::new(state.flag_set(id)),
            _ => Box::new(state.flags.values()),
        };

        let mut flags = FlagMap::new();
        for flag in candidates.filter(|flag| selector.matches(flag)) {
            match flags.get(&flag.key) {
                // Same key in two flag-sets: the higher-priority source wins.
                Some(held) if !has_priority(&self.sources, &held.source, &flag.source) => {}
                _ => {
                    flags.insert(flag.key.clone(), flag.clone());
                }
            }
        }

        let metadata = match selector {
            Selector::Source(source) => state
                .metadata_per_source
                .get(source)
                .cloned()
                .unwrap_or_default(),
            _ => state.merged_metadata(),
        };
        (flags, metadata)
    }

    fn selector_for_flag(&self, flag: &Flag) -> String {
        self.read()
            .source_details
            .get(&flag.source)
            .cloned()
            .unwrap_or_default()
    }

    fn update(
        &self,
        source: &str,
        selector: &str,
        flags: FlagMap,
        metadata: Metadata,
    ) -> Result<UpdateOutcome, StoreError> {
        // Stamp and validate the whole batch before touching state.
        let mut incoming = Vec::with_capacity(flags.len());
        for (key, mut flag) in flags {
            if key.trim().is_empty() {
                return Err(StoreError::InvalidFlag {
                    key,
                    reason: "flag key must not be empty".to_string(),
                });
            }
            flag.key = key;
            flag.source = source.to_owned();
            flag.selector = selector.to_owned();
            flag.flag_set_id = flag.flag_set_from_metadata()?;
            incoming.push(flag);
        }

        let mut state = self.write();
        state
            .metadata_per_source
            .insert(source.to_owned(), metadata);
        state
            .source_details
            .insert(source.to_owned(), selector.to_owned());

        let mut outcome = UpdateOutcome::default();

        // Implicit deletions: flags owned by this exact (source, selector)
        // that the new batch no longer carries.
        let incoming_ids: HashSet<(&str, &str)> = incoming
            .iter()
            .map(|flag| (flag.flag_set_id.as_str(), flag.key.as_str()))
            .collect();
        let stale: Vec<FlagId> = state
            .flags
            .iter()
            .filter(|(_, flag)| flag.source == source && flag.selector == selector)
            .filter(|((set, key), _)| !incoming_ids.contains(&(set.as_str(), key.as_str())))
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            state.flags.remove(&id);
            tracing::debug!(flag = %id.1, flag_set = %id.0, source, "flag removed from source");
            outcome.notifications.insert(
                id.1,
                Notification {
                    kind: NotificationType::Delete,
                    source: source.to_owned(),
                },
            );
            outcome.resync_required = true;
        }

        for flag in incoming {
            let id = (flag.flag_set_id.clone(), flag.key.clone());
            let kind = match state.flags.get(&id) {
                Some(stored) if !stored.content_changed(&flag) => continue,
                Some(_) => NotificationType::Update,
                None => match outcome.notifications.get(&flag.key) {
                    // Deleted from one flag-set and re-created in another.
                    Some(n) if n.kind == NotificationType::Delete => NotificationType::Update,
                    _ => NotificationType::Create,
                },
            };
            tracing::debug!(flag = %flag.key, flag_set = %flag.flag_set_id, source, %kind, "flag stored");
            outcome.notifications.insert(
                flag.key.clone(),
                Notification {
                    kind,
                    source: source.to_owned(),
                },
            );
            state.flags.insert(id, flag);
        }

        if outcome.resync_required {
            tracing::info!(source, selector, "store resync required: flags deleted from source");
        }
        Ok(outcome)
    }

    fn metadata_for_source(&self, source: &str) -> Metadata {
        self.read()
            .metadata_per_source
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
