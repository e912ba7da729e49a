use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use super::PrecacheManifest;
use crate::error::{Result, WorkerError};
use crate::http::{CacheKey, Network, Request, Response};

/// Maximum manifest fetches in flight during an install.
const MAX_CONCURRENT_FETCHES: usize = 8;

/// Directory holding one file per generation
const GENERATIONS_DIR: &str = "generations";

/// Marker file naming the active generation
const ACTIVE_FILE: &str = "ACTIVE";

/// Opaque deployment version token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(String);

impl GenerationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn file_name(&self) -> String {
        let safe: String = self
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        format!("{}.json", safe)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GenerationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A stored response plus the moment it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub response: Response,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

type Entries = HashMap<CacheKey, CachedResponse>;

#[derive(Serialize)]
struct GenerationFileRef<'a> {
    id: &'a GenerationId,
    entries: &'a Entries,
}

#[derive(Deserialize)]
struct GenerationFile {
    id: GenerationId,
    entries: Entries,
}

#[derive(Default)]
struct Storage {
    generations: HashMap<GenerationId, Entries>,
    active: Option<GenerationId>,
}

struct Inner {
    storage: RwLock<Storage>,
    key_locks: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
    root: Option<PathBuf>,
}

/// Generation-partitioned response cache.
///
/// A generation only becomes visible once it is complete, and every write
/// replaces a whole entry. When backed by a directory, each generation lives
/// in `generations/<id>.json` and the active one is named in `ACTIVE`.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    pub fn in_memory() -> Self {
        Self::with_storage(Storage::default(), None)
    }

    /// Open (or create) a store persisted under `root`, reloading whatever a
    /// previous process left there.
    pub fn open_dir(root: PathBuf) -> Result<Self> {
        let generations_dir = root.join(GENERATIONS_DIR);
        std::fs::create_dir_all(&generations_dir)?;

        let mut storage = Storage::default();
        for dir_entry in std::fs::read_dir(&generations_dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<GenerationFile>(&contents) {
                Ok(file) => {
                    debug!(generation = %file.id, entries = file.entries.len(), "Loaded cache generation");
                    storage.generations.insert(file.id, file.entries);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache generation");
                }
            }
        }

        let active_path = root.join(ACTIVE_FILE);
        if active_path.exists() {
            let id = GenerationId::new(std::fs::read_to_string(&active_path)?.trim());
            if storage.generations.contains_key(&id) {
                storage.active = Some(id);
            } else {
                warn!(generation = %id, "Active marker names a missing generation");
            }
        }

        Ok(Self::with_storage(storage, Some(root)))
    }

    fn with_storage(storage: Storage, root: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage: RwLock::new(storage),
                key_locks: Mutex::new(HashMap::new()),
                root,
            }),
        }
    }

    /// Handle on a generation. Opening does not create anything; the
    /// generation appears once `add_all` or `put` stores into it.
    pub fn open(&self, id: GenerationId) -> CacheHandle {
        CacheHandle {
            store: self.clone(),
            generation: id,
        }
    }

    pub async fn list_generations(&self) -> Vec<GenerationId> {
        let storage = self.inner.storage.read().await;
        let mut ids: Vec<GenerationId> = storage.generations.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a generation. Returns whether it existed.
    pub async fn delete(&self, id: &GenerationId) -> Result<bool> {
        let mut storage = self.inner.storage.write().await;
        let existed = storage.generations.remove(id).is_some();
        if existed {
            if let Some(root) = &self.inner.root {
                let path = root.join(GENERATIONS_DIR).join(id.file_name());
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
            if storage.active.as_ref() == Some(id) {
                storage.active = None;
                self.write_active_marker(None)?;
            }
            info!(generation = %id, "Deleted cache generation");
        }
        Ok(existed)
    }

    pub async fn active(&self) -> Option<GenerationId> {
        self.inner.storage.read().await.active.clone()
    }

    pub async fn active_handle(&self) -> Option<CacheHandle> {
        self.active().await.map(|id| self.open(id))
    }

    /// Promote a complete generation to active.
    pub async fn set_active(&self, id: &GenerationId) -> Result<()> {
        let mut storage = self.inner.storage.write().await;
        if !storage.generations.contains_key(id) {
            return Err(WorkerError::UnknownGeneration(id.clone()));
        }
        self.write_active_marker(Some(id))?;
        storage.active = Some(id.clone());
        Ok(())
    }

    /// Look a key up in the active generation.
    pub async fn match_active(&self, key: &CacheKey) -> Option<CachedResponse> {
        let storage = self.inner.storage.read().await;
        let active = storage.active.as_ref()?;
        storage.generations.get(active)?.get(key).cloned()
    }

    /// Acquire the single-writer lock for a key. Holders of the guard are
    /// serialized; the lock spans generations.
    pub async fn lock_key(&self, key: &CacheKey) -> KeyLockGuard {
        let lock = {
            let mut locks = self.key_locks();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        KeyLockGuard {
            store: self.clone(),
            key: key.clone(),
            guard: Some(guard),
        }
    }

    fn key_locks(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<AsyncMutex<()>>>> {
        self.inner
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active_marker(&self, id: Option<&GenerationId>) -> Result<()> {
        let Some(root) = &self.inner.root else {
            return Ok(());
        };
        let path = root.join(ACTIVE_FILE);
        match id {
            Some(id) => write_atomically(&path, id.as_str().as_bytes())?,
            None if path.exists() => std::fs::remove_file(path)?,
            None => {}
        }
        Ok(())
    }

    fn persist(&self, id: &GenerationId, entries: &Entries) -> Result<()> {
        let Some(root) = &self.inner.root else {
            return Ok(());
        };
        let path = root.join(GENERATIONS_DIR).join(id.file_name());
        let contents = serde_json::to_vec(&GenerationFileRef { id, entries })?;
        write_atomically(&path, &contents)
    }
}

/// Held while writing one key. Dropping the last guard for a key also drops
/// its lock entry, so the lock table only holds keys that are in use.
pub struct KeyLockGuard {
    store: CacheStore,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are only taken under the table lock, so the count is stable here
        let mut locks = self.store.key_locks();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Write to a sibling temp file and rename over the target, so readers never
/// observe a half-written file.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Handle on one generation of the store.
#[derive(Clone)]
pub struct CacheHandle {
    store: CacheStore,
    generation: GenerationId,
}

impl CacheHandle {
    pub fn id(&self) -> &GenerationId {
        &self.generation
    }

    pub async fn exists(&self) -> bool {
        let storage = self.store.inner.storage.read().await;
        storage.generations.contains_key(&self.generation)
    }

    pub async fn keys(&self) -> Vec<CacheKey> {
        let storage = self.store.inner.storage.read().await;
        let mut keys: Vec<CacheKey> = storage
            .generations
            .get(&self.generation)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub async fn match_key(&self, key: &CacheKey) -> Option<CachedResponse> {
        let storage = self.store.inner.storage.read().await;
        storage.generations.get(&self.generation)?.get(key).cloned()
    }

    /// Replace exactly one entry. The generation must already exist.
    pub async fn put(&self, key: CacheKey, response: Response) -> Result<()> {
        let mut storage = self.store.inner.storage.write().await;
        let entries = storage
            .generations
            .get_mut(&self.generation)
            .ok_or_else(|| WorkerError::UnknownGeneration(self.generation.clone()))?;

        let previous = entries.insert(key.clone(), CachedResponse::new(response));
        if let Err(e) = self.store.persist(&self.generation, entries) {
            match previous {
                Some(previous) => entries.insert(key, previous),
                None => entries.remove(&key),
            };
            return Err(e);
        }
        debug!(generation = %self.generation, key = %key, "Cache entry written");
        Ok(())
    }

    /// Fetch every manifest resource and store them as one unit.
    ///
    /// Any transport error or non-2xx response aborts the whole operation and
    /// leaves the store exactly as it was. Returns the number of entries stored.
    pub async fn add_all(
        &self,
        manifest: &PrecacheManifest,
        origin: &Url,
        network: &dyn Network,
    ) -> Result<usize> {
        let urls = manifest.resolve(origin)?;

        let staged: Vec<(CacheKey, Response)> = stream::iter(urls)
            .map(|url| async move {
                let request = Request::get(url);
                let response = network.fetch(&request).await?;
                if !response.ok() {
                    return Err(WorkerError::from_status(
                        request.url.as_str(),
                        response.status,
                        &response.body,
                    ));
                }
                Ok::<_, WorkerError>((CacheKey::for_request(&request), response))
            })
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .try_collect()
            .await?;

        let count = staged.len();
        let mut storage = self.store.inner.storage.write().await;
        let mut merged = storage
            .generations
            .get(&self.generation)
            .cloned()
            .unwrap_or_default();
        for (key, response) in staged {
            merged.insert(key, CachedResponse::new(response));
        }
        self.store.persist(&self.generation, &merged)?;
        storage.generations.insert(self.generation.clone(), merged);

        info!(generation = %self.generation, entries = count, "Precached manifest");
        Ok(count)
    }
}
