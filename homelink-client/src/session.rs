//! Typed client-side store of resumable sessions.
//!
//! After a successful login the server hands out a session id; together with
//! the derived session key it lets the next connection skip the password
//! entirely. Entries are keyed by a caller-chosen scope (typically the
//! server URL) and persisted as one JSON file with atomic replace.
//!
//! Non-retryable close codes (4001, 4003) clear the entry automatically
//! when the channel was bound to a cache, so the next connection falls back
//! to a full handshake.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use homelink_core::crypto::SessionKey;

use crate::Error;

/// One resumable session as kept on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    /// The username the session belongs to.
    pub identity: String,
    /// The server-issued session id.
    pub session_id: Uuid,
    /// Hex of the 32-byte session key.
    pub session_key: String,
}

impl StoredSession {
    pub(crate) fn new(identity: &str, session_id: Uuid, key: &SessionKey) -> Self {
        Self {
            identity: identity.to_owned(),
            session_id,
            session_key: hex::encode(key.as_bytes()),
        }
    }

    /// Decodes the stored key. `None` if the entry is corrupt.
    pub fn key(&self) -> Option<SessionKey> {
        let bytes: [u8; 32] = hex::decode(&self.session_key).ok()?.try_into().ok()?;
        Some(SessionKey::from_bytes(bytes))
    }
}

struct Inner {
    path: PathBuf,
    state: Mutex<HashMap<String, StoredSession>>,
}

/// File-backed map of `scope → StoredSession`. Cheap to clone.
#[derive(Clone)]
pub struct SessionCache(Arc<Inner>);

impl SessionCache {
    /// Opens (or creates) the cache file at `path`.
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self(Arc::new(Inner {
            path,
            state: Mutex::new(state),
        })))
    }

    /// The stored session for `scope`, if any.
    pub fn load(&self, scope: &str) -> Option<StoredSession> {
        self.0.state.lock().get(scope).cloned()
    }

    /// Stores (replacing) the session for `scope`.
    pub fn store(&self, scope: &str, session: StoredSession) -> Result<(), Error> {
        let mut state = self.0.state.lock();
        state.insert(scope.to_owned(), session);
        self.persist(&state)
    }

    /// Removes the session for `scope`.
    pub fn clear(&self, scope: &str) -> Result<(), Error> {
        let mut state = self.0.state.lock();
        if state.remove(scope).is_some() {
            self.persist(&state)?;
        }
        Ok(())
    }

    fn persist(&self, state: &HashMap<String, StoredSession>) -> Result<(), Error> {
        let dir = self
            .0
            .path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&tmp, state).map_err(std::io::Error::from)?;
        tmp.persist(&self.0.path).map_err(|err| err.error)?;
        Ok(())
    }
}
