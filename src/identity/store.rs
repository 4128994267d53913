//! Process-wide, mutex-guarded identity table.
//!
//! A single `RwLock`-guarded table with short, lock-held read/write passes
//! and no I/O performed while the lock is held.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{AccessLevel, Identity, IdentityJson, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity {0:?} already exists")]
    Conflict(String),
    #[error("identity {0:?} not found")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Verb recorded in a security-log entry.
#[derive(Debug, Clone, Copy)]
pub enum Verb {
    Add,
    Update,
    Replace,
    Remove,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Remove => "remove",
        }
    }
}

struct Inner {
    identities: HashMap<String, Identity>,
    /// Closed -> open on explicit admin action; open -> closed on timer
    /// expiry, first successful enrollment, any identities write while open,
    /// or shutdown. Guarded by the same lock as `identities`
    /// so "open -> close on first write" is atomic with the write.
    enrollment_open: bool,
}

#[derive(Serialize, Deserialize)]
struct OnDiskIdentity {
    access: AccessLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    local: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    basic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cert: Option<Vec<u8>>,
}

pub struct IdentityStore {
    inner: RwLock<Inner>,
    persist_path: Option<PathBuf>,
}

fn log_mutation(actor: Option<&str>, identity: &Identity, verb: Verb) {
    log::warn!(
        "identity mutation: actor={:?} target={:?} access={} verb={}",
        actor.unwrap_or("<unknown>"),
        identity.name,
        identity.access,
        verb.as_str(),
    );
}

impl IdentityStore {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                identities: HashMap::new(),
                enrollment_open: false,
            }),
            persist_path,
        }
    }

    /// Reload from durable state at startup. Absence of the file is not an
    /// error (first run).
    pub fn load(persist_path: Option<PathBuf>) -> Result<Self, IdentityError> {
        let mut identities = HashMap::new();

        if let Some(path) = &persist_path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                let on_disk: HashMap<String, OnDiskIdentity> = serde_json::from_str(&raw)?;
                for (name, rec) in on_disk {
                    identities.insert(
                        name.clone(),
                        Identity {
                            name,
                            access: rec.access,
                            local: rec.local,
                            basic: rec.basic,
                            cert: rec.cert,
                        },
                    );
                }
            }
        }

        Ok(Self {
            inner: RwLock::new(Inner {
                identities,
                enrollment_open: false,
            }),
            persist_path,
        })
    }

    fn persist(&self, snapshot: &HashMap<String, Identity>) -> Result<(), IdentityError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let on_disk: HashMap<&str, OnDiskIdentity> = snapshot
            .iter()
            .map(|(name, identity)| {
                (
                    name.as_str(),
                    OnDiskIdentity {
                        access: identity.access,
                        local: identity.local,
                        basic: identity.basic.clone(),
                        cert: identity.cert.clone(),
                    },
                )
            })
            .collect();

        let body = serde_json::to_vec_pretty(&on_disk)?;
        write_atomic(path, &body)?;
        Ok(())
    }

    pub fn add(
        &self,
        actor: Option<&str>,
        records: Vec<(String, IdentityJson)>,
    ) -> Result<(), IdentityError> {
        let parsed = records
            .into_iter()
            .map(|(name, json)| Identity::from_json(&name, json).map(|i| (name, i)))
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = {
            let mut guard = self.inner.write();
            for (name, _) in &parsed {
                if guard.identities.contains_key(name) {
                    return Err(IdentityError::Conflict(name.clone()));
                }
            }

            for (name, identity) in parsed {
                log_mutation(actor, &identity, Verb::Add);
                guard.identities.insert(name, identity);
            }

            guard.identities.clone()
        };

        self.persist(&snapshot)
    }

    pub fn update(
        &self,
        actor: Option<&str>,
        records: Vec<(String, IdentityJson)>,
    ) -> Result<(), IdentityError> {
        let parsed = records
            .into_iter()
            .map(|(name, json)| Identity::from_json(&name, json).map(|i| (name, i)))
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = {
            let mut guard = self.inner.write();
            for (name, _) in &parsed {
                if !guard.identities.contains_key(name) {
                    return Err(IdentityError::NotFound(name.clone()));
                }
            }

            for (name, identity) in parsed {
                log_mutation(actor, &identity, Verb::Update);
                guard.identities.insert(name, identity);
            }

            guard.identities.clone()
        };

        self.persist(&snapshot)
    }

    /// `value = None` removes the key; otherwise replaces it. Non-mentioned
    /// keys are left alone.
    pub fn replace(
        &self,
        actor: Option<&str>,
        records: Vec<(String, Option<IdentityJson>)>,
    ) -> Result<(), IdentityError> {
        let parsed = records
            .into_iter()
            .map(|(name, json)| match json {
                Some(json) => Identity::from_json(&name, json).map(|i| (name, Some(i))),
                None => Ok((name, None)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = {
            let mut guard = self.inner.write();
            for (name, identity) in parsed {
                match identity {
                    Some(identity) => {
                        log_mutation(actor, &identity, Verb::Replace);
                        guard.identities.insert(name, identity);
                    }
                    None => {
                        if let Some(removed) = guard.identities.remove(&name) {
                            log_mutation(actor, &removed, Verb::Remove);
                        }
                    }
                }
            }

            guard.identities.clone()
        };

        self.persist(&snapshot)
    }

    /// Unknown names are ignored.
    pub fn remove(&self, actor: Option<&str>, names: Vec<String>) -> Result<(), IdentityError> {
        let snapshot = {
            let mut guard = self.inner.write();
            for name in names {
                if let Some(removed) = guard.identities.remove(&name) {
                    log_mutation(actor, &removed, Verb::Remove);
                }
            }
            guard.identities.clone()
        };

        self.persist(&snapshot)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Identity> {
        self.inner.read().identities.get(name).cloned()
    }

    pub fn get_by_uid(&self, uid: u32) -> Option<Identity> {
        self.inner
            .read()
            .identities
            .values()
            .find(|identity| identity.local == Some(uid))
            .cloned()
    }

    pub fn get_by_basic(&self, name: &str, plaintext: &str) -> Option<Identity> {
        let guard = self.inner.read();
        let identity = guard.identities.get(name)?;
        identity.verify_basic(plaintext).then(|| identity.clone())
    }

    pub fn get_by_cert(&self, der: &[u8]) -> Option<Identity> {
        self.inner
            .read()
            .identities
            .values()
            .find(|identity| identity.cert.as_deref() == Some(der))
            .cloned()
    }

    pub fn list(&self) -> Vec<Identity> {
        self.inner.read().identities.values().cloned().collect()
    }

    pub fn enrollment_open(&self) -> bool {
        self.inner.read().enrollment_open
    }

    pub fn open_enrollment(&self) {
        self.inner.write().enrollment_open = true;
    }

    /// Closes the enrollment window, returning whether it had been open.
    /// Called by `Policy::IdentityWrite` on every write, successful or not.
    pub fn close_enrollment(&self) -> bool {
        let mut guard = self.inner.write();
        std::mem::replace(&mut guard.enrollment_open, false)
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            access: self.access,
            local: self.local,
            basic: self.basic.clone(),
            cert: self.cert.clone(),
        }
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("len", &self.inner.read().identities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_identity() -> IdentityJson {
        IdentityJson {
            access: "read".to_string(),
            local: Some(super::super::LocalBinding { user_id: 1000 }),
            basic: None,
            cert: None,
        }
    }

    #[test]
    fn add_then_remove_round_trips() {
        let store = IdentityStore::new(None);
        store
            .add(Some("admin"), vec![("bob".to_string(), read_identity())])
            .unwrap();
        assert!(store.get_by_name("bob").is_some());

        store.remove(Some("admin"), vec!["bob".to_string()]).unwrap();
        assert!(store.get_by_name("bob").is_none());
    }

    #[test]
    fn add_rejects_duplicate_name_atomically() {
        let store = IdentityStore::new(None);
        store
            .add(Some("admin"), vec![("bob".to_string(), read_identity())])
            .unwrap();

        let err = store.add(
            Some("admin"),
            vec![
                ("carol".to_string(), read_identity()),
                ("bob".to_string(), read_identity()),
            ],
        );
        assert!(matches!(err, Err(IdentityError::Conflict(_))));
        // carol must not have been inserted: the whole batch failed atomically.
        assert!(store.get_by_name("carol").is_none());
    }

    #[test]
    fn lookup_by_uid_matches_local_binding() {
        let store = IdentityStore::new(None);
        store
            .add(Some("admin"), vec![("bob".to_string(), read_identity())])
            .unwrap();

        assert_eq!(store.get_by_uid(1000).unwrap().name, "bob");
        assert!(store.get_by_uid(42).is_none());
    }

    #[test]
    fn close_enrollment_is_idempotent_and_reports_prior_state() {
        let store = IdentityStore::new(None);
        assert!(!store.enrollment_open());

        store.open_enrollment();
        assert!(store.close_enrollment());
        assert!(!store.enrollment_open());
        assert!(!store.close_enrollment());
    }

    #[test]
    fn replace_twice_is_a_noop_on_state() {
        let store = IdentityStore::new(None);
        store
            .replace(Some("admin"), vec![("bob".to_string(), Some(read_identity()))])
            .unwrap();
        let after_first = store.get_by_name("bob").unwrap();

        store
            .replace(Some("admin"), vec![("bob".to_string(), Some(read_identity()))])
            .unwrap();
        let after_second = store.get_by_name("bob").unwrap();

        assert_eq!(after_first.local, after_second.local);
        assert_eq!(after_first.access, after_second.access);
    }
}
