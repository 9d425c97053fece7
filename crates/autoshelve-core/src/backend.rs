use async_trait::async_trait;
use url::Url;

use crate::error::ShelveError;
use crate::types::{PendingChange, Shelveset, WorkspaceHandle};

/// Project context reported by the host (the active team project).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    /// Domain URI of the project collection; may be percent-encoded.
    pub domain_uri: String,
}

/// Host collaborator that knows which project collection is active.
#[async_trait]
pub trait HostContext: Send + Sync {
    /// Returns the active project context, or `None` when nothing is connected.
    async fn active_project_context(&self) -> Result<Option<ProjectContext>, ShelveError>;
}

/// Version-control backend abstraction.
///
/// Shelvesets are owned by the backend: the engine only creates, queries and
/// deletes them. Implementations must be safe to call concurrently, since
/// every workspace attempt runs as its own task.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Returns the backend identifier (e.g., "git", "memory").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Connection
    // =========================================================================

    /// Authenticate against the server at `uri`.
    async fn authenticate(&self, uri: &Url) -> Result<(), ShelveError>;

    /// List all locally known workspaces. The engine filters out workspaces
    /// bound to other servers or without mapped paths.
    async fn list_local_workspaces(&self, uri: &Url) -> Result<Vec<WorkspaceHandle>, ShelveError>;

    // =========================================================================
    // Pending changes
    // =========================================================================

    /// Current pending changes of a workspace.
    async fn pending_changes(
        &self,
        workspace: &WorkspaceHandle,
    ) -> Result<Vec<PendingChange>, ShelveError>;

    // =========================================================================
    // Shelvesets
    // =========================================================================

    /// All shelvesets belonging to `owner`, in no particular order.
    async fn query_shelvesets(&self, owner: &str) -> Result<Vec<Shelveset>, ShelveError>;

    /// Pending changes captured by a shelveset.
    async fn query_shelved_changes(
        &self,
        shelveset: &Shelveset,
    ) -> Result<Vec<PendingChange>, ShelveError>;

    /// Shelve `changes` under `name`, replacing an existing shelveset of the
    /// same name and owner.
    async fn create_shelveset(
        &self,
        workspace: &WorkspaceHandle,
        name: &str,
        comment: &str,
        changes: &[PendingChange],
    ) -> Result<Shelveset, ShelveError>;

    /// Delete a shelveset.
    async fn delete_shelveset(&self, shelveset: &Shelveset) -> Result<(), ShelveError>;
}
