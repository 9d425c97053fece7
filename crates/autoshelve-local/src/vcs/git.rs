use std::path::{Path, PathBuf};

use async_trait::async_trait;
use autoshelve_core::{
    PendingChange, ShelveError, ShelveResult, Shelveset, VersionControl, WorkspaceHandle,
};
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, instrument};
use url::Url;

use crate::store::LocalShelvesetStore;

/// One entry of `git status --porcelain=v1 -z`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub path: String,
    pub deleted: bool,
}

/// Parse NUL-separated porcelain v1 status output.
///
/// Rename and copy entries are followed by their source path, which is
/// skipped. A path listed twice (a staged delete re-created as untracked)
/// yields one entry that is deleted only if every listing says so.
pub fn parse_porcelain(output: &[u8]) -> Vec<StatusEntry> {
    let mut entries: Vec<StatusEntry> = Vec::new();
    let mut tokens = output.split(|b| *b == 0).filter(|t| !t.is_empty());

    while let Some(token) = tokens.next() {
        if token.len() < 4 {
            continue;
        }
        let (index, worktree) = (token[0], token[1]);
        let path = String::from_utf8_lossy(&token[3..]).into_owned();

        if matches!(index, b'R' | b'C') || matches!(worktree, b'R' | b'C') {
            tokens.next();
        }

        let deleted = index == b'D' || worktree == b'D';
        match entries.iter_mut().find(|e| e.path == path) {
            Some(existing) => existing.deleted &= deleted,
            None => entries.push(StatusEntry { path, deleted }),
        }
    }
    entries
}

/// Version-control backend over local git working copies.
///
/// Each configured directory is one workspace. Pending changes come from
/// `git status`; shelvesets live in a [`LocalShelvesetStore`] addressed by
/// its `file://` URL.
#[derive(Debug)]
pub struct GitBackend {
    working_copies: Vec<PathBuf>,
    owner: String,
    store_uri: Url,
    store: LocalShelvesetStore,
}

impl GitBackend {
    pub fn new(
        working_copies: Vec<PathBuf>,
        owner: impl Into<String>,
        store_uri: Url,
        store: LocalShelvesetStore,
    ) -> Self {
        Self {
            working_copies,
            owner: owner.into(),
            store_uri,
            store,
        }
    }

    fn workspace(&self, dir: &Path) -> WorkspaceHandle {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        let mapped_paths = if dir.is_dir() {
            vec![dir.to_path_buf()]
        } else {
            Vec::new()
        };
        WorkspaceHandle::new(name, self.owner.clone(), self.store_uri.clone(), mapped_paths)
    }

    async fn status(dir: &Path) -> ShelveResult<Vec<u8>> {
        let out = Command::new("git")
            .args(["status", "--porcelain=v1", "-z", "--untracked-files=all"])
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| ShelveError::Backend(format!("Failed to run git in {}: {}", dir.display(), e)))?;

        if !out.status.success() {
            return Err(ShelveError::Backend(format!(
                "git status failed in {}: {}",
                dir.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(out.stdout)
    }
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl VersionControl for GitBackend {
    fn backend_name(&self) -> &'static str {
        "git"
    }

    #[instrument(skip(self), level = "debug")]
    async fn authenticate(&self, uri: &Url) -> ShelveResult<()> {
        if uri.scheme() != "file" || uri != &self.store_uri {
            return Err(ShelveError::Connection(format!(
                "unknown shelveset store {}",
                uri
            )));
        }
        if !self.store.base_dir().is_dir() {
            return Err(ShelveError::Connection(format!(
                "shelveset store {} does not exist",
                self.store.base_dir().display()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_local_workspaces(&self, _uri: &Url) -> ShelveResult<Vec<WorkspaceHandle>> {
        Ok(self
            .working_copies
            .iter()
            .map(|dir| self.workspace(dir))
            .collect())
    }

    #[instrument(skip(self, workspace), fields(workspace = %workspace.name), level = "debug")]
    async fn pending_changes(&self, workspace: &WorkspaceHandle) -> ShelveResult<Vec<PendingChange>> {
        let mut changes = Vec::new();

        for dir in &workspace.mapped_paths {
            let output = Self::status(dir).await?;
            for entry in parse_porcelain(&output) {
                let local = dir.join(&entry.path);
                let server_item = format!("$/{}/{}", workspace.name, entry.path);
                let change = if entry.deleted {
                    PendingChange::edit(server_item, local).deleted()
                } else {
                    let change = PendingChange::edit(server_item, &local);
                    match modified_at(&local).await {
                        Some(at) => change.modified(at),
                        None => change,
                    }
                };
                changes.push(change);
            }
        }

        debug!("{} pending changes in {}", changes.len(), workspace.name);
        Ok(changes)
    }

    async fn query_shelvesets(&self, owner: &str) -> ShelveResult<Vec<Shelveset>> {
        self.store.list(owner).await
    }

    async fn query_shelved_changes(&self, shelveset: &Shelveset) -> ShelveResult<Vec<PendingChange>> {
        self.store.changes(shelveset).await
    }

    async fn create_shelveset(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        comment: &str,
        changes: &[PendingChange],
    ) -> ShelveResult<Shelveset> {
        self.store
            .create(&workspace.owner, name, comment, changes)
            .await
    }

    async fn delete_shelveset(&self, shelveset: &Shelveset) -> ShelveResult<()> {
        self.store.delete(shelveset).await
    }
}
