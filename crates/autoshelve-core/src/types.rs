use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ShelveError;

/// Identity written into every shelveset comment; used to recognize engine-owned shelvesets.
pub const EXTENSION_NAME: &str = "Auto Shelve";

/// A local working copy bound to a backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    /// Workspace name (placeholder `{0}`)
    pub name: String,
    /// Owner identity in `domain\login` form (placeholder `{1}`)
    pub owner: String,
    /// Server the workspace is bound to
    pub server_uri: Url,
    /// Local paths mapped into the workspace
    #[serde(default)]
    pub mapped_paths: Vec<PathBuf>,
}

impl WorkspaceHandle {
    /// Create a workspace handle.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        server_uri: Url,
        mapped_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            server_uri,
            mapped_paths,
        }
    }
}

/// One uncommitted edit in a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Server-relative path; the identity used to pair changes across shelvesets
    pub server_item: String,
    /// Path of the file in the working copy
    pub local_item: PathBuf,
    /// Whether the change deletes the item
    #[serde(default)]
    pub is_delete: bool,
    /// When the pending change was recorded
    pub creation_date: DateTime<Utc>,
    /// Last write time of the local file (absent for deletions)
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    /// Content hash recorded when the change was uploaded, if known
    #[serde(default)]
    pub upload_hash: Option<Vec<u8>>,
}

impl PendingChange {
    /// Create an edit of `local_item`, recorded now.
    pub fn edit(server_item: impl Into<String>, local_item: impl Into<PathBuf>) -> Self {
        Self {
            server_item: server_item.into(),
            local_item: local_item.into(),
            is_delete: false,
            creation_date: Utc::now(),
            modified_at: None,
            upload_hash: None,
        }
    }

    /// Mark the change as a deletion.
    pub fn deleted(mut self) -> Self {
        self.is_delete = true;
        self.modified_at = None;
        self
    }

    /// Set the recorded upload hash.
    pub fn with_hash(mut self, hash: impl Into<Vec<u8>>) -> Self {
        self.upload_hash = Some(hash.into());
        self
    }

    /// Set the last write time of the local file.
    pub fn modified(mut self, at: DateTime<Utc>) -> Self {
        self.modified_at = Some(at);
        self
    }

    /// Ordering key for comparisons: deletions use their creation date.
    pub fn last_change_date(&self) -> DateTime<Utc> {
        if self.is_delete {
            self.creation_date
        } else {
            self.modified_at.unwrap_or(self.creation_date)
        }
    }
}

/// A named, backend-persisted capture of pending changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shelveset {
    pub name: String,
    pub owner: String,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub comment: String,
}

impl Shelveset {
    /// Comment recorded on shelvesets created by the engine.
    pub fn engine_comment(change_count: usize) -> String {
        format!("Shelved by {}. {} items", EXTENSION_NAME, change_count)
    }

    /// Whether this shelveset was produced by the engine.
    pub fn is_engine_owned(&self) -> bool {
        self.comment.contains(EXTENSION_NAME)
    }
}

/// Outcome of one workspace's shelve attempt.
#[derive(Debug, Clone, Default)]
pub struct ShelvesetResult {
    /// Candidate shelveset name (empty if the attempt failed before computing it)
    pub shelveset_name: String,
    /// Pending changes captured; zero when no shelveset was created
    pub change_count: usize,
    /// Past shelvesets deleted by the retention policy
    pub purge_count: usize,
    /// Failure that ended the attempt
    pub error: Option<Arc<ShelveError>>,
}

impl ShelvesetResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether a new shelveset was created.
    pub fn created(&self) -> bool {
        self.is_success() && self.change_count > 0
    }
}
