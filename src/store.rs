//! Registry persistence
//!
//! The store owns the canonical copy of the registry. Readers get a value
//! snapshot from [`RegistryStore::load`]; writers take the store lock, load,
//! mutate and [`RegistryStore::save`] the whole document.

use crate::error::{Error, Result};
use crate::models::Registry;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load/save boundary for the registry document
pub trait RegistryStore {
    fn load(&self) -> Result<Registry>;

    fn save(&self, registry: &Registry) -> Result<()>;

    /// Acquire exclusive write access for a load-mutate-save transaction.
    /// The lock is held until the returned guard is dropped.
    fn lock(&self) -> Result<StoreLock> {
        Ok(StoreLock::none())
    }
}

/// Guard for the registry write lock
pub struct StoreLock {
    _file: Option<std::fs::File>,
}

impl StoreLock {
    fn none() -> Self {
        Self { _file: None }
    }

    /// Take a non-blocking exclusive lock on `path`, creating it if needed
    #[cfg(unix)]
    pub fn acquire(path: &Path) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::Locked(path.to_path_buf()));
            }
            return Err(Error::io(path, err));
        }

        // Only the holder may clear the previous pid
        file.set_len(0).map_err(|e| Error::io(path, e))?;
        writeln!(&file, "{}", std::process::id()).map_err(|e| Error::io(path, e))?;
        debug!(path = %path.display(), "Registry lock acquired");

        Ok(Self { _file: Some(file) })
    }

    #[cfg(not(unix))]
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::create(path).map_err(|e| Error::io(path, e))?;
        writeln!(file, "{}", std::process::id()).map_err(|e| Error::io(path, e))?;
        Ok(Self { _file: Some(file) })
    }
}

/// Registry stored as a single YAML file
pub struct YamlStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl YamlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl RegistryStore for YamlStore {
    fn load(&self) -> Result<Registry> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let registry = Registry::from_yaml(&content)?;
        registry.validate()?;
        debug!(path = %self.path.display(), projects = registry.projects.len(), "Registry loaded");
        Ok(registry)
    }

    fn save(&self, registry: &Registry) -> Result<()> {
        registry.validate()?;
        let yaml = registry.to_yaml()?;

        // Write next to the target and rename so readers never see a torn file
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
        tmp.write_all(yaml.as_bytes())
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::io(&self.path, e.error))?;

        info!(path = %self.path.display(), projects = registry.projects.len(), "Registry saved");
        Ok(())
    }

    fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.lock_path)
    }
}

/// In-memory store, for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    registry: Mutex<Registry>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Mutex::new(registry),
            saves: Mutex::new(0),
        }
    }

    /// Number of times the registry has been saved
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn snapshot(&self) -> Registry {
        self.registry.lock().clone()
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<Registry> {
        Ok(self.registry.lock().clone())
    }

    fn save(&self, registry: &Registry) -> Result<()> {
        registry.validate()?;
        *self.registry.lock() = registry.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}
