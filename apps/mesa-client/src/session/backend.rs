use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use directories::BaseDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::SessionError;

/// The opaque key-value persistence the session store writes through.
///
/// The core manages exactly three keys (`auth_token`, `username`,
/// `user_role`); anything else in the underlying store is none of its
/// business.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    fn put(&self, key: &str, value: &str) -> Result<(), SessionError>;
    fn remove(&self, key: &str) -> Result<(), SessionError>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileContents {
    #[serde(default)]
    entries: HashMap<String, String>,
}

/// TOML-file-backed store, the default persistence across process restarts.
///
/// The whole file is rewritten on every mutation; it holds a handful of short
/// strings, one of them a bearer token, so it is created with 0600.
pub struct FileStore {
    path: PathBuf,
    contents: RwLock<FileContents>,
}

impl FileStore {
    pub fn default_path() -> Result<PathBuf, SessionError> {
        let base = BaseDirs::new()
            .ok_or_else(|| SessionError::Storage("unable to determine home directory".into()))?;
        Ok(base.home_dir().join(".mesa").join("session"))
    }

    pub fn open_default() -> Result<Self, SessionError> {
        Self::open(Self::default_path()?)
    }

    pub fn open(path: PathBuf) -> Result<Self, SessionError> {
        let contents = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            toml::from_str(&raw)?
        } else {
            FileContents::default()
        };
        Ok(Self {
            path,
            contents: RwLock::new(contents),
        })
    }

    fn persist(&self, contents: &FileContents) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let serialized = toml::to_string_pretty(contents)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.contents.read().entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), SessionError> {
        let mut contents = self.contents.write();
        contents.entries.insert(key.to_string(), value.to_string());
        self.persist(&contents)
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        let mut contents = self.contents.write();
        if contents.entries.remove(key).is_some() {
            self.persist(&contents)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn scratch_path() -> PathBuf {
        let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "mesa-session-test-{}-{seq}",
            std::process::id()
        ))
    }

    #[test]
    fn file_store_round_trips_across_reopen() {
        let path = scratch_path();
        {
            let store = FileStore::open(path.clone()).unwrap();
            store.put("auth_token", "abc.def.ghi").unwrap();
            store.put("username", "amir").unwrap();
        }
        let reopened = FileStore::open(path.clone()).unwrap();
        assert_eq!(
            reopened.get("auth_token").unwrap().as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(reopened.get("username").unwrap().as_deref(), Some("amir"));

        reopened.remove("auth_token").unwrap();
        assert_eq!(reopened.get("auth_token").unwrap(), None);

        fs::remove_file(&path).ok();
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_readable_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = scratch_path();
        let store = FileStore::open(path.clone()).unwrap();
        store.put("auth_token", "secret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        fs::remove_file(&path).ok();
    }
}
