//! State directory persistence for bb.
//!
//! Backs five kinds of artifact under one fixed directory: the shared
//! config, per-machine snapshots, per-repo metadata, the notify cache, and
//! the global advisory lock. All payloads are YAML with a `version` field
//! first; all writes are whole-file and atomic (write-to-temp + rename in
//! the same directory).
//!
//! The state directory is externally synchronized between machines; this
//! crate never moves bytes across hosts.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use bb_identity::{decode_repo_key, encode_repo_key};
use bb_types::{Config, MachineSnapshot, NotifyCache, RepoMetadata};

pub const CONFIG_FILE: &str = "config.yaml";
pub const MACHINES_DIR: &str = "machines";
pub const REPOS_DIR: &str = "repos";
pub const NOTIFY_CACHE_FILE: &str = "notify_cache.yaml";
pub const LOCK_FILE: &str = "lock";

/// Failures from the state store. Everything here is fatal for the
/// invocation (exit 2); per-repo git failures never surface through this
/// type.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to serialize state for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("state lock unavailable after waiting {waited_ms}ms")]
    LockUnavailable { waited_ms: u128 },
    #[error("config file changed on disk since it was loaded")]
    ConflictChangedOnDisk,
}

pub type Result<T> = std::result::Result<T, StateError>;

fn io_err(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Filesystem-backed store for every bb state artifact.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<home>/.bb`, the conventional state root.
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".bb"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory skeleton if missing.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join(MACHINES_DIR),
            self.root.join(REPOS_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn machine_path(&self, machine_id: &str) -> PathBuf {
        self.root
            .join(MACHINES_DIR)
            .join(format!("{machine_id}.yaml"))
    }

    pub fn repo_meta_path(&self, repo_key: &str) -> PathBuf {
        self.root
            .join(REPOS_DIR)
            .join(format!("{}.yaml", encode_repo_key(repo_key)))
    }

    pub fn notify_cache_path(&self) -> PathBuf {
        self.root.join(NOTIFY_CACHE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Load the shared config, defaulting when the file does not exist.
    pub fn load_config(&self) -> Result<Config> {
        Ok(self.load_config_raw()?.0)
    }

    /// Load the config together with its on-disk bytes, the seed for
    /// change-conflict detection in interactive update flows.
    pub fn load_config_raw(&self) -> Result<(Config, Option<Vec<u8>>)> {
        let path = self.config_path();
        match fs::read(&path) {
            Ok(bytes) => {
                let config = serde_yaml::from_slice(&bytes).map_err(|e| StateError::Malformed {
                    path: path.clone(),
                    source: e,
                })?;
                Ok((config, Some(bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Config::new(), None)),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    pub fn store_config(&self, config: &Config) -> Result<()> {
        self.write_yaml(&self.config_path(), config)
    }

    /// Commit an interactively edited config, failing when the file's
    /// bytes changed since `seed` was loaded.
    pub fn store_config_guarded(&self, config: &Config, seed: Option<&[u8]>) -> Result<()> {
        let path = self.config_path();
        let current = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(&path, e)),
        };
        if current.as_deref() != seed {
            return Err(StateError::ConflictChangedOnDisk);
        }
        self.store_config(config)
    }

    pub fn load_machine(&self, machine_id: &str) -> Result<Option<MachineSnapshot>> {
        self.load_optional(&self.machine_path(machine_id))
    }

    pub fn store_machine(&self, snapshot: &MachineSnapshot) -> Result<()> {
        self.write_yaml(&self.machine_path(&snapshot.machine_id), snapshot)
    }

    /// Every machine snapshot in the fleet, ordered by machine id.
    pub fn list_machines(&self) -> Result<Vec<MachineSnapshot>> {
        let mut snapshots: Vec<MachineSnapshot> = self.list_dir(&self.root.join(MACHINES_DIR))?;
        snapshots.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        Ok(snapshots)
    }

    pub fn load_repo_meta(&self, repo_key: &str) -> Result<Option<RepoMetadata>> {
        self.load_optional(&self.repo_meta_path(repo_key))
    }

    /// Persist metadata unless the normalized form already matches the
    /// on-disk form. Returns whether a write happened; the file's
    /// modification time never advances for a no-op update.
    pub fn store_repo_meta(&self, meta: &RepoMetadata) -> Result<bool> {
        let normalized = meta.normalized();
        if let Some(existing) = self.load_repo_meta(&meta.repo_key)? {
            if existing.normalized() == normalized {
                debug!(repo_key = %meta.repo_key, "metadata unchanged, skipping write");
                return Ok(false);
            }
        }
        self.write_yaml(&self.repo_meta_path(&meta.repo_key), &normalized)?;
        Ok(true)
    }

    pub fn remove_repo_meta(&self, repo_key: &str) -> Result<()> {
        let path = self.repo_meta_path(repo_key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Every repo metadata file, ordered by repo key.
    pub fn list_repo_metas(&self) -> Result<Vec<RepoMetadata>> {
        let mut metas: Vec<RepoMetadata> = self.list_dir(&self.root.join(REPOS_DIR))?;
        metas.sort_by(|a, b| a.repo_key.cmp(&b.repo_key));
        Ok(metas)
    }

    /// Repo keys present on disk, decoded from their filenames.
    pub fn list_repo_keys(&self) -> Result<Vec<String>> {
        let dir = self.root.join(REPOS_DIR);
        let mut keys = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(io_err(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".yaml") {
                keys.push(decode_repo_key(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn load_notify_cache(&self) -> Result<NotifyCache> {
        Ok(self
            .load_optional(&self.notify_cache_path())?
            .unwrap_or_else(NotifyCache::new))
    }

    pub fn store_notify_cache(&self, cache: &NotifyCache) -> Result<()> {
        self.write_yaml(&self.notify_cache_path(), cache)
    }

    fn load_optional<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => {
                let value = serde_yaml::from_slice(&bytes).map_err(|e| StateError::Malformed {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(path, e)),
        }
    }

    fn list_dir<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_err(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                if let Some(value) = self.load_optional(&path)? {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }

    fn write_yaml<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let yaml = serde_yaml::to_string(value).map_err(|e| StateError::Serialize {
            path: path.to_path_buf(),
            source: e,
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
            file.write_all(yaml.as_bytes()).map_err(|e| io_err(&tmp, e))?;
            file.sync_all().map_err(|e| io_err(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }
}

/// Holder identity written into the lock file for diagnostics. The lock
/// itself is OS-enforced; this payload is advisory reading material for
/// `doctor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    #[serde(default)]
    pub version: i64,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Exclusive, OS-level advisory lock over the whole state directory.
/// Released on drop, on every exit path.
#[derive(Debug)]
pub struct GlobalLock {
    file: File,
    path: PathBuf,
}

impl GlobalLock {
    /// Acquire within `wait`, polling; `lock_unavailable` past the bound.
    pub fn acquire(store: &StateStore, wait: Duration) -> Result<Self> {
        store.ensure_layout()?;
        let path = store.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if started.elapsed() < wait => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => {
                    return Err(StateError::LockUnavailable {
                        waited_ms: started.elapsed().as_millis(),
                    });
                }
            }
        }

        let lock = Self { file, path };
        lock.write_holder_info();
        Ok(lock)
    }

    fn write_holder_info(&self) {
        let info = LockInfo {
            version: bb_types::STATE_VERSION,
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            acquired_at: Utc::now(),
        };
        // Best effort: the flock is authoritative, the payload is not.
        if let Ok(yaml) = serde_yaml::to_string(&info) {
            let _ = (&self.file).set_len(0);
            let _ = (&self.file).write_all(yaml.as_bytes());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded holder of the lock file, if any.
    pub fn read_holder(store: &StateStore) -> Result<Option<LockInfo>> {
        let path = store.lock_path();
        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(serde_yaml::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Whether another process currently holds the lock.
    pub fn is_held(store: &StateStore) -> bool {
        let path = store.lock_path();
        let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Serializes repo-metadata writes from parallel observation workers.
///
/// One instance per process, shared by reference; the store itself stays
/// free of interior mutability.
#[derive(Debug)]
pub struct MetaStore {
    store: StateStore,
    write_serializer: Mutex<()>,
}

impl MetaStore {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            write_serializer: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn load(&self, repo_key: &str) -> Result<Option<RepoMetadata>> {
        self.store.load_repo_meta(repo_key)
    }

    /// Load metadata for `repo_key`, creating and persisting a default
    /// entry on first observation. `auto_push` seeds new entries only;
    /// existing metadata is returned untouched.
    pub fn ensure(
        &self,
        repo_key: &str,
        name: &str,
        origin_url: &str,
        auto_push: bb_types::AutoPushMode,
    ) -> Result<RepoMetadata> {
        let _guard = self.write_serializer.lock().expect("meta serializer poisoned");
        if let Some(existing) = self.store.load_repo_meta(repo_key)? {
            return Ok(existing);
        }
        let mut meta = RepoMetadata::new(repo_key, name);
        meta.origin_url = origin_url.to_string();
        meta.auto_push = auto_push;
        self.store.store_repo_meta(&meta)?;
        Ok(meta)
    }

    pub fn persist(&self, meta: &RepoMetadata) -> Result<bool> {
        let _guard = self.write_serializer.lock().expect("meta serializer poisoned");
        self.store.store_repo_meta(meta)
    }
}
