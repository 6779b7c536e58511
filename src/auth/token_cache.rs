//! Token cache for the identity client, with optional file persistence.
//!
//! `DurableTokenCache` stores one opaque snapshot per process in a single
//! file. Every read, write and delete of that file holds one process-wide
//! lock, so concurrent logins never interleave partial snapshots.
//!
//! `TokenCache` is the in-memory account cache. It seeds itself from the
//! durable file once, before the first access, and writes back only when
//! its `has_state_changed` flag is set.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::error::AuthError;
use super::token::Token;

pub const DEFAULT_CACHE_FILE: &str = "TokenCache.dat";

fn file_lock() -> &'static Mutex<()> {
    static FILE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    FILE_LOCK.get_or_init(|| Mutex::new(()))
}

/// File-backed snapshot store.
#[derive(Debug, Clone)]
pub struct DurableTokenCache {
    path: PathBuf,
}

impl DurableTokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole snapshot. A missing file yields an empty blob.
    pub async fn load(&self) -> Result<Vec<u8>, AuthError> {
        let _guard = file_lock().lock().await;
        match fs::read(&self.path).await {
            Ok(bytes) => {
                tracing::debug!("Token cache read {} bytes from disk", bytes.len());
                Ok(bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the snapshot. Written to a sibling file and renamed so a
    /// crash mid-write leaves the previous snapshot intact.
    pub async fn save(&self, bytes: &[u8]) -> Result<(), AuthError> {
        let _guard = file_lock().lock().await;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&tmp, &self.path).await?;
        tracing::debug!("Token cache wrote {} bytes to disk", bytes.len());
        Ok(())
    }

    /// Delete the snapshot file. Deleting a missing file is not an error.
    pub async fn clear(&self) -> Result<(), AuthError> {
        let _guard = file_lock().lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One signed-in account as remembered by the identity client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedAccount {
    pub account_id: String,
    pub username: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<Token>,
    pub id_token: Option<Token>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    accounts: BTreeMap<String, CachedAccount>,
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Default)]
struct CacheState {
    snapshot: Snapshot,
    has_state_changed: bool,
    seeded: bool,
}

/// Account cache, optionally mirrored to a `DurableTokenCache`.
pub struct TokenCache {
    state: Mutex<CacheState>,
    durable: Option<DurableTokenCache>,
}

impl TokenCache {
    /// Cache that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            durable: None,
        }
    }

    pub fn persistent(durable: DurableTokenCache) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            durable: Some(durable),
        }
    }

    /// Run `f` against the snapshot: seed from disk on first use, flush
    /// afterwards if `f` changed anything.
    ///
    /// Cache I/O failures are logged and the cache carries on in memory.
    async fn access<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        let mut state = self.state.lock().await;

        if !state.seeded {
            state.seeded = true;
            if let Some(durable) = &self.durable {
                match load_snapshot(durable).await {
                    Ok(Some(snapshot)) => {
                        tracing::debug!(
                            "Token cache seeded with {} account(s)",
                            snapshot.accounts.len()
                        );
                        state.snapshot = snapshot;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("Token cache unavailable, starting empty: {}", e);
                    }
                }
            }
        }

        let result = f(&mut state);

        if state.has_state_changed {
            match &self.durable {
                Some(durable) => match store_snapshot(durable, &state.snapshot).await {
                    Ok(()) => state.has_state_changed = false,
                    Err(e) => tracing::warn!("Token cache write failed: {}", e),
                },
                None => state.has_state_changed = false,
            }
        }

        result
    }

    /// Look up an account. Without an id, the single cached account is
    /// returned if there is exactly one.
    pub async fn account(&self, account_id: Option<&str>) -> Option<CachedAccount> {
        self.access(|state| {
            let accounts = &state.snapshot.accounts;
            match account_id {
                Some(id) => accounts.get(id).cloned(),
                None if accounts.len() == 1 => accounts.values().next().cloned(),
                None => None,
            }
        })
        .await
    }

    pub async fn accounts(&self) -> Vec<CachedAccount> {
        self.access(|state| state.snapshot.accounts.values().cloned().collect())
            .await
    }

    pub async fn upsert(&self, account: CachedAccount) {
        self.access(|state| {
            let existing = state.snapshot.accounts.get(&account.account_id);
            if existing != Some(&account) {
                state
                    .snapshot
                    .accounts
                    .insert(account.account_id.clone(), account);
                state.has_state_changed = true;
            }
        })
        .await
    }

    pub async fn remove(&self, account_id: &str) -> bool {
        self.access(|state| {
            let removed = state.snapshot.accounts.remove(account_id).is_some();
            state.has_state_changed |= removed;
            removed
        })
        .await
    }

    /// Forget every account and delete the durable file.
    pub async fn clear(&self) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        state.snapshot.accounts.clear();
        state.has_state_changed = false;
        state.seeded = true;
        match &self.durable {
            Some(durable) => durable.clear().await,
            None => Ok(()),
        }
    }
}

async fn load_snapshot(durable: &DurableTokenCache) -> Result<Option<Snapshot>, AuthError> {
    let bytes = durable.load().await?;
    if bytes.is_empty() {
        return Ok(None);
    }
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    Ok(Some(snapshot))
}

async fn store_snapshot(durable: &DurableTokenCache, snapshot: &Snapshot) -> Result<(), AuthError> {
    let mut bytes = serde_json::to_vec(&Snapshot {
        version: SNAPSHOT_VERSION,
        accounts: snapshot.accounts.clone(),
    })?;
    bytes.push(b'\n');
    durable.save(&bytes).await
}
