use anyhow::Result;

use crate::config::MemhubConfig;
use crate::db::Db;
use crate::protocol::auth::{fingerprint, SqliteCredentialStore};

/// Issue a new bearer credential for `owner` and print it once.
pub fn add(config: &MemhubConfig, owner: &str, label: Option<&str>) -> Result<()> {
    crate::memory::types::validate_owner(owner)?;
    let store = SqliteCredentialStore::new(Db::open(config.resolved_db_path())?);
    let credential = format!(
        "mh_{}{}",
        uuid::Uuid::now_v7().simple(),
        uuid::Uuid::now_v7().simple()
    );
    store.insert(&credential, owner, label)?;

    println!("{credential}");
    eprintln!(
        "Key {} issued for owner '{owner}'. It is not stored and cannot be shown again.",
        fingerprint(&credential)
    );
    Ok(())
}

pub fn revoke(config: &MemhubConfig, credential: &str) -> Result<()> {
    let store = SqliteCredentialStore::new(Db::open(config.resolved_db_path())?);
    if store.revoke(credential)? {
        println!("Revoked key {}.", fingerprint(credential));
    } else {
        println!("No active key {}.", fingerprint(credential));
    }
    Ok(())
}
