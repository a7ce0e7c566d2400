//! flagplane core library: flag model, source documents, the flag store,
//! default-variant resolution and daemon configuration.
//!
//! - [`types`]: flags, variants, metadata, notifications
//! - [`store`]: [`FlagStore`] contract and the in-memory [`MemoryStore`]
//! - [`document`]: parsing source documents into update batches
//! - [`resolve`]: default-variant resolution with typed errors
//! - [`config`]: `~/.flagplane/config.yaml`

pub mod config;
pub mod document;
pub mod error;
pub mod resolve;
pub mod store;
pub mod types;

pub use error::{ConfigError, DocumentError, ResolveError, StoreError};
pub use store::{FlagMap, FlagStore, MemoryStore, Selector, UpdateOutcome};
pub use types::{
    Flag, Metadata, Notification, NotificationType, Notifications, SubscriptionId, VariantKind,
    VariantValue, SENTINEL_FLAG_SET,
};
