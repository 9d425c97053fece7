use std::path::{Path, PathBuf};
use std::sync::Arc;

use autoshelve_core::compare::content_hash;
use autoshelve_core::{PendingChange, ShelveError, ShelveResult, Shelveset};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use crate::lock::{FileLock, LockGuard};

/// A shelveset entry of an owner's index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredShelveset {
    id: String,
    #[serde(flatten)]
    shelveset: Shelveset,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShelvesetIndex {
    #[serde(default)]
    shelvesets: Vec<StoredShelveset>,
}

impl ShelvesetIndex {
    fn find(&self, name: &str) -> Option<&StoredShelveset> {
        self.shelvesets.iter().find(|s| s.shelveset.name == name)
    }

    /// Remove every entry named `name`, returning their ids.
    fn remove(&mut self, name: &str) -> Vec<String> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.shelvesets)
            .into_iter()
            .partition(|s| s.shelveset.name == name);
        self.shelvesets = kept;
        removed.into_iter().map(|s| s.id).collect()
    }
}

/// Both levels of an owner's index lock, released together.
struct OwnerLock {
    _file: LockGuard,
    _process: OwnedMutexGuard<()>,
}

/// On-disk shelveset store.
///
/// Organizes data by owner:
/// ```text
/// {base_dir}/
///   {url-encoded owner}/
///     index.json
///     index.lock
///     shelvesets/
///       {id}/
///         changes.json
///         files/{n}
/// ```
///
/// Index mutations are serialized per owner within the process and, through
/// `index.lock`, across processes. Readers rely on atomic renames instead.
#[derive(Debug)]
pub struct LocalShelvesetStore {
    base_dir: PathBuf,
    owner_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalShelvesetStore {
    /// Create a new store with the given base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            owner_locks: DashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the directory of an owner.
    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.base_dir.join(urlencoding::encode(owner).as_ref())
    }

    /// Get the path to an owner's index file.
    fn index_path(&self, owner: &str) -> PathBuf {
        self.owner_dir(owner).join("index.json")
    }

    /// Get the directory of a stored shelveset.
    fn shelveset_dir(&self, owner: &str, id: &str) -> PathBuf {
        self.owner_dir(owner).join("shelvesets").join(id)
    }

    async fn lock_owner(&self, owner: &str) -> ShelveResult<OwnerLock> {
        let mutex = self
            .owner_locks
            .entry(owner.to_string())
            .or_default()
            .clone();
        let process = mutex.lock_owned().await;
        let file = FileLock::new(self.owner_dir(owner).join("index.lock"))
            .acquire()
            .await?;
        Ok(OwnerLock {
            _file: file,
            _process: process,
        })
    }

    async fn load_index(&self, owner: &str) -> ShelveResult<ShelvesetIndex> {
        let path = self.index_path(owner);
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ShelvesetIndex::default()),
            Err(e) => Err(ShelveError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save_index(&self, owner: &str, index: &ShelvesetIndex) -> ShelveResult<()> {
        let json = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.index_path(owner), &json).await
    }

    async fn remove_dirs(&self, owner: &str, ids: &[String]) {
        for id in ids {
            let dir = self.shelveset_dir(owner, id);
            if let Err(e) = fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                }
            }
        }
    }

    /// All shelvesets of `owner`, in index order.
    #[instrument(skip(self), level = "debug")]
    pub async fn list(&self, owner: &str) -> ShelveResult<Vec<Shelveset>> {
        let index = self.load_index(owner).await?;
        Ok(index.shelvesets.into_iter().map(|s| s.shelveset).collect())
    }

    /// Pending changes captured by a stored shelveset.
    #[instrument(skip(self, shelveset), fields(shelveset = %shelveset.name), level = "debug")]
    pub async fn changes(&self, shelveset: &Shelveset) -> ShelveResult<Vec<PendingChange>> {
        let index = self.load_index(&shelveset.owner).await?;
        let stored = index.find(&shelveset.name).ok_or_else(|| {
            ShelveError::NotFound(format!(
                "shelveset {} of {}",
                shelveset.name, shelveset.owner
            ))
        })?;

        let path = self
            .shelveset_dir(&shelveset.owner, &stored.id)
            .join("changes.json");
        let json = fs::read_to_string(&path).await.map_err(|e| {
            ShelveError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Store `changes` as a shelveset, replacing one of the same name and owner.
    ///
    /// Files still present in the working copy are copied into the store and
    /// their content hash is recorded as the upload hash.
    #[instrument(skip(self, comment, changes), fields(count = changes.len()), level = "debug")]
    pub async fn create(
        &self,
        owner: &str,
        name: &str,
        comment: &str,
        changes: &[PendingChange],
    ) -> ShelveResult<Shelveset> {
        let _lock = self.lock_owner(owner).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.shelveset_dir(owner, &id);
        let files_dir = dir.join("files");
        fs::create_dir_all(&files_dir).await.map_err(|e| {
            ShelveError::Io(format!("Failed to create {}: {}", files_dir.display(), e))
        })?;

        let stored = async {
            write_changes(&dir, changes).await?;

            let shelveset = Shelveset {
                name: name.to_string(),
                owner: owner.to_string(),
                creation_date: Utc::now(),
                comment: comment.to_string(),
            };

            let mut index = self.load_index(owner).await?;
            let replaced = index.remove(name);
            index.shelvesets.push(StoredShelveset {
                id: id.clone(),
                shelveset: shelveset.clone(),
            });
            self.save_index(owner, &index).await?;
            Ok::<_, ShelveError>((shelveset, replaced))
        }
        .await;

        let (shelveset, replaced) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                // Nothing references the new directory yet
                self.remove_dirs(owner, std::slice::from_ref(&id)).await;
                return Err(e);
            }
        };
        self.remove_dirs(owner, &replaced).await;

        debug!(
            "Stored shelveset {} for {} ({} replaced)",
            name,
            owner,
            replaced.len()
        );
        Ok(shelveset)
    }

    /// Delete a stored shelveset.
    #[instrument(skip(self, shelveset), fields(shelveset = %shelveset.name), level = "debug")]
    pub async fn delete(&self, shelveset: &Shelveset) -> ShelveResult<()> {
        let owner = &shelveset.owner;
        let _lock = self.lock_owner(owner).await?;

        let mut index = self.load_index(owner).await?;
        let removed = index.remove(&shelveset.name);
        if removed.is_empty() {
            return Err(ShelveError::NotFound(format!(
                "shelveset {} of {}",
                shelveset.name, owner
            )));
        }
        self.save_index(owner, &index).await?;
        self.remove_dirs(owner, &removed).await;

        debug!("Deleted shelveset {} for {}", shelveset.name, owner);
        Ok(())
    }
}

/// Copy the content of `changes` into `dir` and record the captured changes.
async fn write_changes(dir: &Path, changes: &[PendingChange]) -> ShelveResult<()> {
    let files_dir = dir.join("files");
    let mut captured = Vec::with_capacity(changes.len());
    for (n, change) in changes.iter().enumerate() {
        let mut change = change.clone();
        if !change.is_delete {
            match fs::read(&change.local_item).await {
                Ok(content) => {
                    let hash = content_hash(&content);
                    debug!(
                        "Captured {} ({} bytes, {})",
                        change.server_item,
                        content.len(),
                        hex::encode(&hash[..8])
                    );
                    write_atomic(&files_dir.join(n.to_string()), &content).await?;
                    change.upload_hash = Some(hash);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} vanished before capture", change.local_item.display());
                }
                Err(e) => {
                    return Err(ShelveError::Io(format!(
                        "Failed to read {}: {}",
                        change.local_item.display(),
                        e
                    )))
                }
            }
        }
        captured.push(change);
    }

    let json = serde_json::to_vec_pretty(&captured)?;
    write_atomic(&dir.join("changes.json"), &json).await
}

/// Write via a temp file and rename, so readers never see partial content.
async fn write_atomic(path: &Path, data: &[u8]) -> ShelveResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            ShelveError::Io(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, data).await.map_err(|e| {
        ShelveError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
    })?;
    fs::rename(&temp_path, path).await.map_err(|e| {
        ShelveError::Io(format!("Failed to rename to {}: {}", path.display(), e))
    })?;
    Ok(())
}
