use crate::sync::{EntityKind, SyncEntity, SyncError, SyncOperation};
use crate::utils::now_millis;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// On-device store of one entity type.
///
/// Calls are synchronous. `insert` and `update` stamp `updatedAt` so that it strictly increases
/// on every local mutation; `put` stores a snapshot verbatim for versions that already carry an
/// authoritative timestamp (remote rows, merges).
pub trait LocalStore<E: SyncEntity>: Send + 'static {
    fn fetch_all(&self) -> Result<Vec<E>, SyncError>;
    fn fetch_one(&self, id: &str) -> Result<Option<E>, SyncError>;
    /// Write the snapshot exactly as given.
    fn put(&mut self, entity: E) -> Result<(), SyncError>;
    /// Remove and return the entity if present.
    fn remove(&mut self, id: &str) -> Result<Option<E>, SyncError>;

    fn insert(&mut self, entity: E) -> Result<E, SyncError> {
        self.stamp_and_put(entity)
    }

    fn update(&mut self, entity: E) -> Result<E, SyncError> {
        self.stamp_and_put(entity)
    }

    fn delete(&mut self, id: &str) -> Result<bool, SyncError> {
        Ok(self.remove(id)?.is_some())
    }

    fn stamp_and_put(&mut self, mut entity: E) -> Result<E, SyncError> {
        let previous = self.fetch_one(entity.id())?.map(|e| e.updated_at());
        entity.set_updated_at(next_timestamp(entity.updated_at(), previous));
        self.put(entity.clone())?;
        Ok(entity)
    }
}

/// Timestamp for a local mutation: now, but always past every version seen for the entity.
pub fn next_timestamp(given: i64, previous: Option<i64>) -> i64 {
    let floor = given.max(previous.unwrap_or(i64::MIN)).saturating_add(1);
    now_millis().max(floor)
}

/// Map-backed local store
pub struct MemoryLocalStore<E> {
    entities: BTreeMap<String, E>,
}

impl<E: SyncEntity> MemoryLocalStore<E> {
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }
}

impl<E: SyncEntity> Default for MemoryLocalStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SyncEntity> LocalStore<E> for MemoryLocalStore<E> {
    fn fetch_all(&self) -> Result<Vec<E>, SyncError> {
        Ok(self.entities.values().cloned().collect())
    }

    fn fetch_one(&self, id: &str) -> Result<Option<E>, SyncError> {
        Ok(self.entities.get(id).cloned())
    }

    fn put(&mut self, entity: E) -> Result<(), SyncError> {
        self.entities.insert(entity.id().to_string(), entity);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<Option<E>, SyncError> {
        Ok(self.entities.remove(id))
    }
}

/// File-based implementation of LocalStore
///
/// Keeps every entity of one type in `local_{table}.json` and rewrites the file atomically on
/// each mutation.
pub struct FileLocalStore<E> {
    path: PathBuf,
    entities: BTreeMap<String, E>,
}

impl<E: SyncEntity> FileLocalStore<E> {
    /// Open the store under `data_dir`, loading any existing file.
    pub fn open(data_dir: &Path) -> Result<Self, SyncError> {
        std::fs::create_dir_all(data_dir)?;
        let path = Self::get_store_filename(data_dir);

        let entities = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let list: Vec<E> = serde_json::from_str(&content).map_err(|e| {
                SyncError::PersistenceError(format!("Failed to parse local store {:?}: {}", path, e))
            })?;
            list.into_iter()
                .map(|entity| (entity.id().to_string(), entity))
                .collect()
        } else {
            BTreeMap::new()
        };

        info!("Opened local {} store with {} entities", E::KIND, entities.len());
        Ok(Self { path, entities })
    }

    fn get_store_filename(data_dir: &Path) -> PathBuf {
        data_dir.join(format!("local_{}.json", E::KIND.table_name()))
    }

    fn flush(&self) -> Result<(), SyncError> {
        let list: Vec<&E> = self.entities.values().collect();
        let content = serde_json::to_vec_pretty(&list)?;
        write_atomic(&self.path, &content)
    }
}

impl<E: SyncEntity> LocalStore<E> for FileLocalStore<E> {
    fn fetch_all(&self) -> Result<Vec<E>, SyncError> {
        Ok(self.entities.values().cloned().collect())
    }

    fn fetch_one(&self, id: &str) -> Result<Option<E>, SyncError> {
        Ok(self.entities.get(id).cloned())
    }

    fn put(&mut self, entity: E) -> Result<(), SyncError> {
        let id = entity.id().to_string();
        let previous = self.entities.insert(id.clone(), entity);
        if let Err(e) = self.flush() {
            // Keep memory consistent with disk.
            match previous {
                Some(previous) => self.entities.insert(id, previous),
                None => self.entities.remove(&id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<Option<E>, SyncError> {
        let Some(removed) = self.entities.remove(id) else {
            return Ok(None);
        };
        if let Err(e) = self.flush() {
            self.entities.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }
}

/// Durable storage for the operation queue
pub trait QueueRepository: Send + Sync {
    /// Load the persisted queue. Unreadable entries are dropped, never fatal.
    fn load(&self) -> Result<Vec<SyncOperation>, SyncError>;
    /// Replace the persisted queue. Returns once the data is on stable storage.
    fn save(&self, operations: &[SyncOperation]) -> Result<(), SyncError>;
}

/// Decode a persisted queue, dropping entries that no longer deserialize.
///
/// Returns `None` if the document is not a JSON array at all.
pub fn decode_queue(content: &str) -> Option<Vec<SyncOperation>> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(content) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Persisted queue is unreadable: {}", e);
            return None;
        }
    };

    let mut operations = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<SyncOperation>(entry) {
            Ok(operation) => operations.push(operation),
            Err(e) => warn!("Dropping unreadable queue entry {}: {}", index, e),
        }
    }
    Some(operations)
}

/// File-based implementation of QueueRepository
pub struct FileQueueRepository {
    path: PathBuf,
}

impl FileQueueRepository {
    pub fn new(data_dir: &Path, kind: EntityKind) -> Result<Self, SyncError> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: Self::get_queue_filename(data_dir, kind),
        })
    }

    /// Well-known storage key of the queue for `kind`
    pub fn get_queue_filename(data_dir: &Path, kind: EntityKind) -> PathBuf {
        data_dir.join(format!("sync_queue_{}.json", kind))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueRepository for FileQueueRepository {
    fn load(&self) -> Result<Vec<SyncOperation>, SyncError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            SyncError::PersistenceError(format!("Failed to read queue file: {}", e))
        })?;

        match decode_queue(&content) {
            Some(operations) => {
                info!(
                    "Loaded {} queued operations from {:?}",
                    operations.len(),
                    self.path
                );
                Ok(operations)
            }
            None => {
                let corrupt = self.path.with_extension("json.corrupt");
                if let Err(e) = std::fs::rename(&self.path, &corrupt) {
                    warn!("Failed to set aside corrupt queue {:?}: {}", self.path, e);
                } else {
                    warn!("Corrupt queue moved to {:?}", corrupt);
                }
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, operations: &[SyncOperation]) -> Result<(), SyncError> {
        let content = serde_json::to_vec_pretty(operations)?;
        write_atomic(&self.path, &content)
    }
}

/// In-memory implementation of QueueRepository.
///
/// Stores the serialized document, so reloading goes through the same decoding as the file
/// repository. Clones share the slot, which lets tests simulate a process restart.
#[derive(Clone, Default)]
pub struct MemoryQueueRepository {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a raw persisted document.
    pub fn with_contents(content: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(content.into()))),
        }
    }

    pub fn contents(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl QueueRepository for MemoryQueueRepository {
    fn load(&self) -> Result<Vec<SyncOperation>, SyncError> {
        Ok(self
            .contents()
            .and_then(|content| decode_queue(&content))
            .unwrap_or_default())
    }

    fn save(&self, operations: &[SyncOperation]) -> Result<(), SyncError> {
        let content = serde_json::to_string(operations)?;
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(content);
        Ok(())
    }
}

/// Write to a sibling temp file, sync it, then rename over the target.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), SyncError> {
    use std::io::Write;

    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp).map_err(|e| {
        SyncError::PersistenceError(format!("Failed to create {:?}: {}", tmp, e))
    })?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|e| SyncError::PersistenceError(format!("Failed to write {:?}: {}", tmp, e)))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        SyncError::PersistenceError(format!("Failed to replace {:?}: {}", path, e))
    })?;
    Ok(())
}
