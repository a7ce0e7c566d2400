//! File-backed flag source.
//!
//! Each load is a full-replacement batch for the source's
//! `(id, selector)` pair. Content is SHA-256 gated: re-reading an unchanged
//! file never reaches the store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use flagplane_core::{
    config::SourceConfig,
    document::{DocumentFormat, FlagDocument},
    FlagMap, FlagStore, Metadata, NotificationType, UpdateOutcome,
};

use crate::error::{io_err, DaemonError};

#[derive(Debug, Clone)]
pub struct FileSource {
    id: String,
    selector: String,
    path: PathBuf,
    last_digest: Option<String>,
}

/// What a single load did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// File content matched the last applied digest; the store was not touched.
    pub unchanged: bool,
    pub missing: bool,
    pub outcome: UpdateOutcome,
}

impl LoadReport {
    pub fn changed(&self) -> bool {
        !self.outcome.is_empty()
    }

    pub fn count(&self, kind: NotificationType) -> usize {
        self.outcome
            .notifications
            .values()
            .filter(|n| n.kind == kind)
            .count()
    }
}

impl FileSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            id: config.id(),
            selector: config.selector(),
            path: config.uri.clone(),
            last_digest: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file and apply it to `store`.
    ///
    /// A missing file applies an empty batch, removing every flag this
    /// source previously contributed. On a parse or store error no digest is
    /// held, so the next load retries.
    pub fn load(&mut self, store: &dyn FlagStore) -> Result<LoadReport, DaemonError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => Some(content),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(io_err(&self.path, err)),
        };

        let Some(content) = content else {
            let outcome = store.update(&self.id, &self.selector, FlagMap::new(), Metadata::new())?;
            self.last_digest = None;
            tracing::warn!(source = %self.id, "source file missing; its flags were removed");
            return Ok(LoadReport {
                missing: true,
                outcome,
                ..LoadReport::default()
            });
        };

        let digest = content_digest(&content);
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            tracing::debug!(source = %self.id, "source content unchanged");
            return Ok(LoadReport {
                unchanged: true,
                ..LoadReport::default()
            });
        }

        // Forget the previous digest first: a failed load must be retried
        // even if the file is restored to its last good content.
        self.last_digest = None;
        let document = FlagDocument::parse(&content, DocumentFormat::from_path(&self.path))
            .map_err(|source| DaemonError::Document {
                path: self.path.clone(),
                source,
            })?;
        let outcome = store.update(
            &self.id,
            &self.selector,
            document.flags,
            document.metadata,
        )?;
        self.last_digest = Some(digest);

        for (key, notification) in &outcome.notifications {
            tracing::debug!(source = %self.id, flag = %key, kind = %notification.kind, "flag changed");
        }
        Ok(LoadReport {
            outcome,
            ..LoadReport::default()
        })
    }
}

fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
