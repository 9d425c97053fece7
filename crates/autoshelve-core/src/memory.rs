//! In-memory backend for tests and embedders.
//!
//! Nothing is persistent. Failure switches let tests drive the engine's
//! error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;
use url::Url;

use crate::backend::{HostContext, ProjectContext, VersionControl};
use crate::compare::content_hash;
use crate::error::{ShelveError, ShelveResult};
use crate::types::{PendingChange, Shelveset, WorkspaceHandle};

#[derive(Default)]
struct State {
    workspaces: Vec<WorkspaceHandle>,
    /// Pending changes by workspace name
    pending: HashMap<String, Vec<PendingChange>>,
    /// Stored shelvesets with the changes they captured
    shelvesets: Vec<(Shelveset, Vec<PendingChange>)>,
}

/// Version-control backend holding everything in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
    reject_connections: AtomicBool,
    fail_listing: AtomicBool,
    fail_pending: AtomicBool,
    pending_delay_ms: AtomicU64,
    connect_count: AtomicUsize,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ShelveResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| ShelveError::Lock(e.to_string()))
    }

    fn write(&self) -> ShelveResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| ShelveError::Lock(e.to_string()))
    }

    /// Register a local workspace.
    pub fn add_workspace(&self, workspace: WorkspaceHandle) -> ShelveResult<()> {
        self.write()?.workspaces.push(workspace);
        Ok(())
    }

    /// Replace the pending changes of a workspace.
    pub fn set_pending_changes(
        &self,
        workspace_name: &str,
        changes: Vec<PendingChange>,
    ) -> ShelveResult<()> {
        self.write()?
            .pending
            .insert(workspace_name.to_string(), changes);
        Ok(())
    }

    /// Store a shelveset as-is, keeping its creation date.
    pub fn insert_shelveset(
        &self,
        shelveset: Shelveset,
        changes: Vec<PendingChange>,
    ) -> ShelveResult<()> {
        self.write()?.shelvesets.push((shelveset, changes));
        Ok(())
    }

    /// All stored shelvesets, oldest first.
    pub fn shelvesets(&self) -> ShelveResult<Vec<Shelveset>> {
        let state = self.read()?;
        let mut all: Vec<Shelveset> = state.shelvesets.iter().map(|(s, _)| s.clone()).collect();
        all.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
        Ok(all)
    }

    /// Make `authenticate` fail.
    pub fn reject_connections(&self, reject: bool) {
        self.reject_connections.store(reject, Ordering::SeqCst);
    }

    /// Make `list_local_workspaces` fail.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make `pending_changes` fail.
    pub fn fail_pending_changes(&self, fail: bool) {
        self.fail_pending.store(fail, Ordering::SeqCst);
    }

    /// Make `pending_changes` wait `delay` before answering.
    pub fn delay_pending_changes(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.pending_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of successful authentications.
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }
}

/// Hash recorded for a change when it is shelved.
fn upload_hash(change: &PendingChange) -> Option<Vec<u8>> {
    if change.is_delete {
        return change.upload_hash.clone();
    }
    match std::fs::read(&change.local_item) {
        Ok(content) => Some(content_hash(&content)),
        Err(_) => change.upload_hash.clone(),
    }
}

#[async_trait]
impl VersionControl for MemoryBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn authenticate(&self, uri: &Url) -> ShelveResult<()> {
        if self.reject_connections.load(Ordering::SeqCst) {
            return Err(ShelveError::Connection(format!(
                "authentication rejected by {}",
                uri
            )));
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_local_workspaces(&self, _uri: &Url) -> ShelveResult<Vec<WorkspaceHandle>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ShelveError::Backend("workspace cache unavailable".to_string()));
        }
        Ok(self.read()?.workspaces.clone())
    }

    #[instrument(skip(self, workspace), fields(workspace = %workspace.name), level = "debug")]
    async fn pending_changes(&self, workspace: &WorkspaceHandle) -> ShelveResult<Vec<PendingChange>> {
        let delay = self.pending_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_pending.load(Ordering::SeqCst) {
            return Err(ShelveError::Backend(format!(
                "cannot query pending changes of {}",
                workspace.name
            )));
        }
        Ok(self
            .read()?
            .pending
            .get(&workspace.name)
            .cloned()
            .unwrap_or_default())
    }

    #[instrument(skip(self), level = "debug")]
    async fn query_shelvesets(&self, owner: &str) -> ShelveResult<Vec<Shelveset>> {
        Ok(self
            .read()?
            .shelvesets
            .iter()
            .filter(|(s, _)| s.owner == owner)
            .map(|(s, _)| s.clone())
            .collect())
    }

    #[instrument(skip(self, shelveset), fields(shelveset = %shelveset.name), level = "debug")]
    async fn query_shelved_changes(&self, shelveset: &Shelveset) -> ShelveResult<Vec<PendingChange>> {
        self.read()?
            .shelvesets
            .iter()
            .find(|(s, _)| s.name == shelveset.name && s.owner == shelveset.owner)
            .map(|(_, changes)| changes.clone())
            .ok_or_else(|| ShelveError::NotFound(format!("shelveset {}", shelveset.name)))
    }

    #[instrument(skip(self, workspace, changes), fields(workspace = %workspace.name), level = "debug")]
    async fn create_shelveset(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        comment: &str,
        changes: &[PendingChange],
    ) -> ShelveResult<Shelveset> {
        let captured: Vec<PendingChange> = changes
            .iter()
            .map(|c| PendingChange {
                upload_hash: upload_hash(c),
                ..c.clone()
            })
            .collect();

        let shelveset = Shelveset {
            name: name.to_string(),
            owner: workspace.owner.clone(),
            creation_date: Utc::now(),
            comment: comment.to_string(),
        };

        let mut state = self.write()?;
        state
            .shelvesets
            .retain(|(s, _)| !(s.name == shelveset.name && s.owner == shelveset.owner));
        state.shelvesets.push((shelveset.clone(), captured));
        Ok(shelveset)
    }

    #[instrument(skip(self, shelveset), fields(shelveset = %shelveset.name), level = "debug")]
    async fn delete_shelveset(&self, shelveset: &Shelveset) -> ShelveResult<()> {
        let mut state = self.write()?;
        let before = state.shelvesets.len();
        state
            .shelvesets
            .retain(|(s, _)| !(s.name == shelveset.name && s.owner == shelveset.owner));
        if state.shelvesets.len() == before {
            return Err(ShelveError::NotFound(format!("shelveset {}", shelveset.name)));
        }
        Ok(())
    }
}

/// Host context with a fixed domain URI.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    domain_uri: Option<String>,
}

impl StaticContext {
    pub fn new(domain_uri: impl Into<String>) -> Self {
        Self {
            domain_uri: Some(domain_uri.into()),
        }
    }

    /// A host with no active project.
    pub fn none() -> Self {
        Self { domain_uri: None }
    }
}

#[async_trait]
impl HostContext for StaticContext {
    async fn active_project_context(&self) -> ShelveResult<Option<ProjectContext>> {
        Ok(self.domain_uri.clone().map(|domain_uri| ProjectContext { domain_uri }))
    }
}
