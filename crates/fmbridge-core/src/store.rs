//! Durable credential storage.
//!
//! The store owns a data directory holding the persisted Apple session
//! material (`session.json`, written on every state transition) and the
//! last-poll marker that keeps restarts from immediately re-polling the
//! report gateway. Beacon keys come from configuration and are never
//! written here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use fmbridge_types::AccountTokens;

use crate::error::{Error, Result};

const SESSION_FILE: &str = "session.json";
const POLL_MARKER_FILE: &str = "last_poll.json";

/// Session material as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    /// The opaque token bundle from the last successful login or refresh.
    pub tokens: AccountTokens,
    /// When the tokens were last obtained.
    #[serde(with = "time::serde::rfc3339")]
    pub refreshed_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct PollMarker {
    #[serde(with = "time::serde::rfc3339")]
    last_poll_at: OffsetDateTime,
}

/// File-backed store for session material and the poll marker.
///
/// Exclusively owns its directory's contents; all other components hold
/// only transient in-memory copies.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at the given data directory.
    ///
    /// The directory is created on first write, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The data directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load persisted session material, if any.
    pub fn load_session(&self) -> Result<Option<PersistedSession>> {
        match self.read(SESSION_FILE)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist session material, replacing any previous state.
    pub fn save_session(&self, session: &PersistedSession) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        self.write(SESSION_FILE, &bytes)
    }

    /// Remove persisted session material.
    ///
    /// Called on irrecoverable auth failure; a missing file is fine.
    pub fn clear_session(&self) -> Result<()> {
        self.remove(SESSION_FILE)
    }

    /// When the report gateway was last polled, if known.
    pub fn last_poll_at(&self) -> Result<Option<OffsetDateTime>> {
        match self.read(POLL_MARKER_FILE)? {
            Some(bytes) => {
                let marker: PollMarker = serde_json::from_slice(&bytes)?;
                Ok(Some(marker.last_poll_at))
            }
            None => Ok(None),
        }
    }

    /// Record a completed poll attempt.
    pub fn record_poll(&self, at: OffsetDateTime) -> Result<()> {
        let bytes = serde_json::to_vec(&PollMarker { last_poll_at: at })?;
        self.write(POLL_MARKER_FILE, &bytes)
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn read(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(file);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store { path, source: e }),
        }
    }

    fn write(&self, file: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::Store {
            path: self.dir.clone(),
            source: e,
        })?;
        let path = self.path(file);
        debug!("writing {}", path.display());
        std::fs::write(&path, bytes).map_err(|e| Error::Store { path, source: e })
    }

    fn remove(&self, file: &str) -> Result<()> {
        let path = self.path(file);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store { path, source: e }),
        }
    }
}
