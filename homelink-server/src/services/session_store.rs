//! Durable store of resumable sessions.
//!
//! A session binds a random id to the username and session key established
//! by a successful handshake. Sessions are independent of live sockets and
//! may be resumed many times until TTL expiry, explicit revoke, or LRU
//! overflow. The map is persisted as one JSON file with atomic replace, so
//! resumes keep working across server restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use homelink_core::envelope;
use homelink_core::crypto::SessionKey;
use homelink_types::envelope::PayloadFormat;
use homelink_types::handshake::{ResumeFailure, ResumeProof};

use super::StoreError;
use crate::metrics::METRICS_ID_SESSIONS_EVICTED;

/// Accepted clock skew of the resume proof timestamp.
const PROOF_MAX_SKEW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    username: String,
    /// Hex of the 32-byte session key. The file lives under the server's
    /// data dir; the key never goes to the wire in this form.
    session_key: String,
    created_at: u64,
    last_used_at: u64,
}

struct Inner {
    path: PathBuf,
    ttl: Duration,
    capacity: usize,
    state: Mutex<HashMap<Uuid, SessionRecord>>,
}

/// Shared handle to the session store. Cheap to clone.
#[derive(Clone)]
pub struct SessionStore(Arc<Inner>);

impl SessionStore {
    /// Opens (or creates) the store file at `path`.
    pub fn open(path: PathBuf, ttl: Duration, capacity: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let map = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!("loaded {} resumable sessions", HashMap::len(&map));
        Ok(Self(Arc::new(Inner {
            path,
            ttl,
            capacity,
            state: Mutex::new(map),
        })))
    }

    /// Creates a fresh session for `username`, evicting the least recently
    /// used record if the store is full. Returns the new session id.
    pub fn create(&self, username: &str, key: &SessionKey) -> Result<Uuid, StoreError> {
        let session_id = Uuid::new_v4();
        let now = unix_now();
        let mut state = self.0.state.lock();
        while state.len() >= self.0.capacity {
            let Some(oldest) = state
                .iter()
                .min_by_key(|(_, record)| record.last_used_at)
                .map(|(id, _)| *id)
            else {
                break;
            };
            state.remove(&oldest);
            ::metrics::counter!(METRICS_ID_SESSIONS_EVICTED).increment(1);
        }
        state.insert(
            session_id,
            SessionRecord {
                username: username.to_owned(),
                session_key: hex::encode(key.as_bytes()),
                created_at: now,
                last_used_at: now,
            },
        );
        self.persist(&state)?;
        Ok(session_id)
    }

    /// Attempts to resume `session_id` for `identity` with the given proof
    /// envelope (hex). On success the record's last-use time is refreshed
    /// and the stored key is returned.
    pub fn resume(
        &self,
        session_id: Uuid,
        identity: &str,
        proof_hex: &str,
    ) -> Result<SessionKey, ResumeFailure> {
        let mut state = self.0.state.lock();
        let (username, last_used_at, key_hex) = match state.get(&session_id) {
            Some(record) => (
                record.username.clone(),
                record.last_used_at,
                record.session_key.clone(),
            ),
            None => return Err(ResumeFailure::Unknown),
        };
        if username != identity {
            return Err(ResumeFailure::Unknown);
        }
        let now = unix_now();
        if now.saturating_sub(last_used_at) > self.0.ttl.as_secs() {
            state.remove(&session_id);
            ::metrics::counter!(METRICS_ID_SESSIONS_EVICTED).increment(1);
            let _ = self.persist(&state);
            return Err(ResumeFailure::Expired);
        }

        let key = decode_key(&key_hex).ok_or(ResumeFailure::BadProof)?;
        let frame = hex::decode(proof_hex).map_err(|_| ResumeFailure::BadProof)?;
        let proof: ResumeProof = match envelope::open(&key, &frame) {
            Ok((PayloadFormat::Json, payload)) => {
                serde_json::from_slice(&payload).map_err(|_| ResumeFailure::BadProof)?
            }
            _ => return Err(ResumeFailure::BadProof),
        };
        let now_ms = now * 1000;
        let skew_ms = PROOF_MAX_SKEW.as_millis() as u64;
        if proof.timestamp.abs_diff(now_ms) > skew_ms {
            return Err(ResumeFailure::BadProof);
        }

        if let Some(record) = state.get_mut(&session_id) {
            record.last_used_at = now;
        }
        let _ = self.persist(&state);
        Ok(key)
    }

    /// Drops a session immediately.
    pub fn revoke(&self, session_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.0.state.lock();
        if state.remove(&session_id).is_some() {
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Removes every session past its TTL. Called by the background sweep.
    pub fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = unix_now();
        let ttl = self.0.ttl.as_secs();
        let mut state = self.0.state.lock();
        let before = state.len();
        state.retain(|_, record| now.saturating_sub(record.last_used_at) <= ttl);
        let evicted = before - state.len();
        if evicted > 0 {
            ::metrics::counter!(METRICS_ID_SESSIONS_EVICTED).increment(evicted as u64);
            self.persist(&state)?;
        }
        Ok(evicted)
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.0.state.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, state: &HashMap<Uuid, SessionRecord>) -> Result<(), StoreError> {
        let dir = self.0.path.parent().unwrap_or(std::path::Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&tmp, state)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.0.path).map_err(|err| err.error)?;
        Ok(())
    }
}

fn decode_key(hex_key: &str) -> Option<SessionKey> {
    let bytes = hex::decode(hex_key).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    Some(SessionKey::from_bytes(bytes))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use homelink_core::envelope::{resume_proof_at, resume_proof_now};

    fn open_store(dir: &tempfile::TempDir, ttl: Duration, capacity: usize) -> SessionStore {
        SessionStore::open(dir.path().join("sessions.json"), ttl, capacity).unwrap()
    }

    #[test]
    fn create_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600), 8);
        let key = SessionKey::random();
        let id = store.create("alice", &key).unwrap();

        let proof = resume_proof_now(&key).unwrap();
        let resumed = store.resume(id, "alice", &proof).unwrap();
        assert_eq!(resumed, key);
    }

    #[test]
    fn resume_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::random();
        let id = {
            let store = open_store(&dir, Duration::from_secs(3600), 8);
            store.create("alice", &key).unwrap()
        };
        let store = open_store(&dir, Duration::from_secs(3600), 8);
        let proof = resume_proof_now(&key).unwrap();
        assert!(store.resume(id, "alice", &proof).is_ok());
    }

    #[test]
    fn unknown_session_and_wrong_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600), 8);
        let key = SessionKey::random();
        let id = store.create("alice", &key).unwrap();
        let proof = resume_proof_now(&key).unwrap();

        assert_eq!(
            store.resume(Uuid::new_v4(), "alice", &proof).unwrap_err(),
            ResumeFailure::Unknown
        );
        assert_eq!(
            store.resume(id, "mallory", &proof).unwrap_err(),
            ResumeFailure::Unknown
        );
    }

    #[test]
    fn stale_proof_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600), 8);
        let key = SessionKey::random();
        let id = store.create("alice", &key).unwrap();

        let stale = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
            - 6 * 60 * 1000;
        let proof = resume_proof_at(&key, stale).unwrap();
        assert_eq!(
            store.resume(id, "alice", &proof).unwrap_err(),
            ResumeFailure::BadProof
        );
    }

    #[test]
    fn wrong_key_proof_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600), 8);
        let id = store.create("alice", &SessionKey::random()).unwrap();
        let proof = resume_proof_now(&SessionKey::random()).unwrap();
        assert_eq!(
            store.resume(id, "alice", &proof).unwrap_err(),
            ResumeFailure::BadProof
        );
    }

    #[test]
    fn ttl_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(0), 8);
        let key = SessionKey::random();
        let id = store.create("alice", &key).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let proof = resume_proof_now(&key).unwrap();
        assert_eq!(
            store.resume(id, "alice", &proof).unwrap_err(),
            ResumeFailure::Expired
        );
        // expired records are dropped eagerly
        assert!(store.is_empty());
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600), 2);
        let first = store.create("alice", &SessionKey::random()).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let _second = store.create("alice", &SessionKey::random()).unwrap();
        let _third = store.create("alice", &SessionKey::random()).unwrap();
        assert_eq!(store.len(), 2);
        let key = SessionKey::random();
        let proof = resume_proof_now(&key).unwrap();
        assert_eq!(
            store.resume(first, "alice", &proof).unwrap_err(),
            ResumeFailure::Unknown
        );
    }

    #[test]
    fn revoke_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(3600), 8);
        let key = SessionKey::random();
        let id = store.create("alice", &key).unwrap();
        store.revoke(id).unwrap();
        let proof = resume_proof_now(&key).unwrap();
        assert_eq!(
            store.resume(id, "alice", &proof).unwrap_err(),
            ResumeFailure::Unknown
        );
    }
}
