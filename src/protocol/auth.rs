//! Bearer-credential resolution for the network transport.
//!
//! Credentials are stored only as SHA-256 hex digests in `api_keys`, written by the
//! external dashboard. Plaintext credentials are never logged; [`fingerprint`] gives a short
//! prefix of the digest for correlation.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::db::Db;

/// Resolves a presented credential to an owner id.
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` for an unknown or revoked credential.
    fn resolve(&self, credential: &str) -> Result<Option<String>>;
}

pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// First 8 hex chars of the credential digest.
pub fn fingerprint(credential: &str) -> String {
    hash_credential(credential)[..8].to_string()
}

#[derive(Clone)]
pub struct SqliteCredentialStore {
    db: Db,
}

impl SqliteCredentialStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register a credential for `owner`. Used by tests and the `keys add` command; the
    /// dashboard normally owns this table.
    pub fn insert(&self, credential: &str, owner: &str, label: Option<&str>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO api_keys (key_hash, owner_id, label, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                hash_credential(credential),
                owner,
                label,
                crate::memory::types::now_timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn revoke(&self, credential: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let n = conn.execute(
            "UPDATE api_keys SET revoked_at = ?2 WHERE key_hash = ?1 AND revoked_at IS NULL",
            params![
                hash_credential(credential),
                crate::memory::types::now_timestamp()
            ],
        )?;
        Ok(n > 0)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn resolve(&self, credential: &str) -> Result<Option<String>> {
        let conn = self.db.read()?;
        let owner = conn
            .query_row(
                "SELECT owner_id FROM api_keys WHERE key_hash = ?1 AND revoked_at IS NULL",
                params![hash_credential(credential)],
                |r| r.get(0),
            )
            .optional()?;
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_credentials_only() {
        let store = SqliteCredentialStore::new(Db::open_in_memory().unwrap());
        store.insert("secret-a", "alice", Some("laptop")).unwrap();

        assert_eq!(store.resolve("secret-a").unwrap().as_deref(), Some("alice"));
        assert_eq!(store.resolve("secret-b").unwrap(), None);
    }

    #[test]
    fn revoked_credentials_stop_resolving() {
        let store = SqliteCredentialStore::new(Db::open_in_memory().unwrap());
        store.insert("secret-a", "alice", None).unwrap();
        assert!(store.revoke("secret-a").unwrap());
        assert!(!store.revoke("secret-a").unwrap());
        assert_eq!(store.resolve("secret-a").unwrap(), None);
    }

    #[test]
    fn plaintext_is_never_stored() {
        let db = Db::open_in_memory().unwrap();
        let store = SqliteCredentialStore::new(db.clone());
        store.insert("secret-a", "alice", None).unwrap();

        let conn = db.lock().unwrap();
        let stored: String = conn
            .query_row("SELECT key_hash FROM api_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored.len(), 64);
        assert_ne!(stored, "secret-a");
        assert!(stored.starts_with(&fingerprint("secret-a")));
    }
}
