use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, file sources and socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] flagplane_core::ConfigError),

    #[error("source document error in {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: flagplane_core::DocumentError,
    },

    #[error("store rejected update: {0}")]
    Store(#[from] flagplane_core::StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] flagplane_sync::SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
