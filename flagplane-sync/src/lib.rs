//! # flagplane-sync
//!
//! Cached, pre-serialized views of the flag store and bounded fan-out to
//! subscribers.
//!
//! Producers call [`Multiplexer::publish`] after a store update that changed
//! something; watchers [`Multiplexer::register`] a bounded channel and get
//! one [`Payload`] per publish cycle.

pub mod error;
pub mod multiplexer;

pub use error::SyncError;
pub use multiplexer::{Multiplexer, Payload, EMPTY_SNAPSHOT};
