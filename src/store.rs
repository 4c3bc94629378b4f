//! Durable storage for the mutation queue.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::QueuedMutation;

/// Abstraction over where queued mutations are persisted.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Loads every persisted mutation in queue order.
    async fn load(&self) -> Result<Vec<QueuedMutation>>;

    /// Replaces the persisted queue with `items`.
    async fn save(&self, items: &[QueuedMutation]) -> Result<()>;
}

#[derive(Serialize, Deserialize, Default)]
struct QueueFile {
    #[serde(default)]
    mutations: Vec<QueuedMutation>,
}

/// Queue persisted as a TOML file, rewritten atomically (write tmp + rename).
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    /// Creates a store backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks that the backing file's directory exists and accepts writes.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the failed step.
    pub async fn check_writable(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let scratch = self.path.with_extension("toml.check");
        tokio::fs::write(&scratch, b"").await?;
        tokio::fs::remove_file(&scratch).await?;
        Ok(())
    }

    /// Moves the backing file aside to `<name>.corrupt` so a fresh queue can
    /// start. Returns the new location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be renamed.
    pub async fn quarantine(&self) -> Result<PathBuf> {
        let target = self.path.with_extension("toml.corrupt");
        tokio::fs::rename(&self.path, &target).await?;
        Ok(target)
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self) -> Result<Vec<QueuedMutation>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: QueueFile = toml::from_str(&contents)?;
        Ok(file.mutations)
    }

    async fn save(&self, items: &[QueuedMutation]) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp_path = self.path.with_extension("toml.tmp");
        let toml_str = toml::to_string(&QueueFile {
            mutations: items.to_vec(),
        })?;

        tokio::fs::write(&tmp_path, toml_str).await?;

        // Payloads may carry form data; keep them private to the user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms).await?;
        }

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

/// Non-durable store. Backs [`QueueBackend::Memory`].
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    items: tokio::sync::Mutex<Vec<QueuedMutation>>,
}

impl MemoryQueueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<QueuedMutation>> {
        Ok(self.items.lock().await.clone())
    }

    async fn save(&self, items: &[QueuedMutation]) -> Result<()> {
        *self.items.lock().await = items.to_vec();
        Ok(())
    }
}

/// The queue store a worker runs with: the TOML file under the state
/// directory, or memory when that directory cannot be written.
#[derive(Debug)]
pub enum QueueBackend {
    File(FileQueueStore),
    Memory(MemoryQueueStore),
}

impl QueueBackend {
    /// Uses the file at `path` if its directory is writable, and otherwise
    /// falls back to memory with a warning.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let file = FileQueueStore::new(path);
        match file.check_writable().await {
            Ok(()) => Self::File(file),
            Err(e) => {
                log::warn!(
                    "Cannot write queue state at {} ({e}), queued writes will not survive a restart",
                    file.path().display()
                );
                Self::Memory(MemoryQueueStore::new())
            }
        }
    }

    /// Returns true if queued mutations survive a restart.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

#[async_trait]
impl QueueStore for QueueBackend {
    async fn load(&self) -> Result<Vec<QueuedMutation>> {
        match self {
            Self::File(store) => store.load().await,
            Self::Memory(store) => store.load().await,
        }
    }

    async fn save(&self, items: &[QueuedMutation]) -> Result<()> {
        match self {
            Self::File(store) => store.save(items).await,
            Self::Memory(store) => store.save(items).await,
        }
    }
}

#[async_trait]
impl<S: QueueStore + ?Sized> QueueStore for std::sync::Arc<S> {
    async fn load(&self) -> Result<Vec<QueuedMutation>> {
        (**self).load().await
    }

    async fn save(&self, items: &[QueuedMutation]) -> Result<()> {
        (**self).save(items).await
    }
}
