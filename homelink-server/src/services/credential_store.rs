//! File-backed user credential store.
//!
//! The on-disk form is an append-only journal of register/unregister
//! operations (one JSON object per line), materialized into a map at load
//! time. Appends are the hot path; [`CredentialStore::compact`] rewrites the
//! journal atomically through a temp file. Passwords never appear here, only
//! SRP salt/verifier pairs.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::StoreError;

/// One registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// The username, unique across the store.
    pub username: String,
    /// SRP salt, hex.
    pub salt: String,
    /// SRP verifier `v = g^x mod N`, hex.
    pub verifier: String,
    /// Unix seconds of (re-)registration.
    pub created_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Register {
        #[serde(flatten)]
        credential: Credential,
    },
    Unregister {
        username: String,
    },
}

struct Inner {
    path: PathBuf,
    state: RwLock<HashMap<String, Credential>>,
}

/// Shared handle to the credential store. Cheap to clone; mutation is
/// serialized, lookups are read-mostly.
#[derive(Clone)]
pub struct CredentialStore(Arc<Inner>);

impl CredentialStore {
    /// Opens the journal at `path`, creating parent directories as needed.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut map = HashMap::new();
        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JournalEntry>(&line)? {
                        JournalEntry::Register { credential } => {
                            map.insert(credential.username.clone(), credential);
                        }
                        JournalEntry::Unregister { username } => {
                            map.remove(&username);
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tracing::debug!("loaded {} credentials from journal", map.len());
        Ok(Self(Arc::new(Inner {
            path,
            state: RwLock::new(map),
        })))
    }

    /// Registers (or explicitly re-registers) a user.
    pub fn register(
        &self,
        username: &str,
        salt: &str,
        verifier: &str,
    ) -> Result<(), StoreError> {
        let credential = Credential {
            username: username.to_owned(),
            salt: salt.to_owned(),
            verifier: verifier.to_owned(),
            created_at: unix_now(),
        };
        let mut state = self.0.state.write();
        self.append(&JournalEntry::Register {
            credential: credential.clone(),
        })?;
        state.insert(username.to_owned(), credential);
        Ok(())
    }

    /// Removes a user. Existing resumable sessions are unaffected; revoking
    /// them is the caller's concern.
    pub fn unregister(&self, username: &str) -> Result<(), StoreError> {
        let mut state = self.0.state.write();
        self.append(&JournalEntry::Unregister {
            username: username.to_owned(),
        })?;
        state.remove(username);
        Ok(())
    }

    /// Looks up a user's credential.
    pub fn lookup(&self, username: &str) -> Option<Credential> {
        self.0.state.read().get(username).cloned()
    }

    /// Rewrites the journal to one register entry per live user, atomically.
    pub fn compact(&self) -> Result<(), StoreError> {
        let state = self.0.state.read();
        let dir = self.0.path.parent().unwrap_or(std::path::Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for credential in state.values() {
            serde_json::to_writer(
                &mut tmp,
                &JournalEntry::Register {
                    credential: credential.clone(),
                },
            )?;
            tmp.write_all(b"\n")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.0.path).map_err(|err| err.error)?;
        Ok(())
    }

    // callers hold the write lock
    fn append(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.0.path)?;
        serde_json::to_writer(&mut file, entry)?;
        file.write_all(b"\n")?;
        Ok(())
    }
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

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::open(dir.path().join("credentials.jsonl")).unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register("alice", "00ff", "beef").unwrap();
        let credential = store.lookup("alice").unwrap();
        assert_eq!(credential.salt, "00ff");
        assert_eq!(credential.verifier, "beef");
        assert!(store.lookup("bob").is_none());
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.jsonl");
        {
            let store = CredentialStore::open(path.clone()).unwrap();
            store.register("alice", "00", "01").unwrap();
            store.register("bob", "02", "03").unwrap();
            store.unregister("bob").unwrap();
        }
        let store = CredentialStore::open(path).unwrap();
        assert!(store.lookup("alice").is_some());
        assert!(store.lookup("bob").is_none());
    }

    #[test]
    fn re_register_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register("alice", "00", "01").unwrap();
        store.register("alice", "aa", "bb").unwrap();
        let credential = store.lookup("alice").unwrap();
        assert_eq!(credential.salt, "aa");
    }

    #[test]
    fn compact_keeps_live_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.jsonl");
        let store = CredentialStore::open(path.clone()).unwrap();
        store.register("alice", "00", "01").unwrap();
        store.register("bob", "02", "03").unwrap();
        store.unregister("bob").unwrap();
        store.compact().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        let reopened = CredentialStore::open(path).unwrap();
        assert!(reopened.lookup("alice").is_some());
        assert!(reopened.lookup("bob").is_none());
    }
}
