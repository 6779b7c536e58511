//! Identity mapping: the last signed-in user id per provider key.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Key-value store for `provider key -> user id`.
///
/// Treated as synchronous and always available; implementations log
/// storage failures instead of returning them.
pub trait UserStore: Send + Sync {
    fn get_user_id(&self, key: &str) -> Option<String>;
    fn save_user(&self, key: &str, user_id: &str);
    fn clear_user(&self, key: &str);
}

/// Process-local store, used for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for MemoryUserStore {
    fn get_user_id(&self, key: &str) -> Option<String> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.get(key).filter(|id| !id.is_empty()).cloned()
    }

    fn save_user(&self, key: &str, user_id: &str) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.insert(key.to_string(), user_id.to_string());
    }

    fn clear_user(&self, key: &str) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.remove(key);
    }
}

/// TOML file of `key = "user id"` pairs.
///
/// The whole file is rewritten on every change; the mutex keeps writers
/// within this process from interleaving.
pub struct FileUserStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read user store")?;
        toml::from_str(&content).context("Failed to parse user store")
    }

    fn write(&self, users: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).context("Failed to create user store directory")?;
        }
        let content = toml::to_string_pretty(users).context("Failed to serialize user store")?;
        fs::write(&self.path, content).context("Failed to write user store")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, perms)
                .context("Failed to set user store permissions")?;
        }

        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut users = self.read().unwrap_or_else(|e| {
            tracing::warn!("User store unreadable, starting a fresh one: {:#}", e);
            BTreeMap::new()
        });
        f(&mut users);
        self.write(&users)
    }
}

impl UserStore for FileUserStore {
    fn get_user_id(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.read() {
            Ok(mut users) => users.remove(key).filter(|id| !id.is_empty()),
            Err(e) => {
                tracing::warn!("User store unreadable, treating {} as absent: {:#}", key, e);
                None
            }
        }
    }

    fn save_user(&self, key: &str, user_id: &str) {
        if let Err(e) = self.update(|users| {
            users.insert(key.to_string(), user_id.to_string());
        }) {
            tracing::warn!("Failed to save user id for {}: {:#}", key, e);
        }
    }

    fn clear_user(&self, key: &str) {
        if let Err(e) = self.update(|users| {
            users.remove(key);
        }) {
            tracing::warn!("Failed to clear user id for {}: {:#}", key, e);
        }
    }
}
