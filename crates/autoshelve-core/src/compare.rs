//! Change-equivalence between the working copy and the last shelveset.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::error::{ShelveError, ShelveResult};
use crate::types::PendingChange;

/// SHA-256 of `content`; the fingerprint recorded as an upload hash.
pub fn content_hash(content: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.finalize().to_vec()
}

/// Fingerprint of a pending change as it stands now.
///
/// Deletions and changes whose local file is gone keep the recorded upload
/// hash; anything else is hashed from disk.
fn current_fingerprint(change: &PendingChange) -> ShelveResult<Option<Vec<u8>>> {
    if change.is_delete || !change.local_item.is_file() {
        return Ok(change.upload_hash.clone());
    }

    let content = std::fs::read(&change.local_item).map_err(|e| {
        ShelveError::Io(format!(
            "Failed to read {}: {}",
            change.local_item.display(),
            e
        ))
    })?;
    Ok(Some(content_hash(&content)))
}

/// Whether `current` differs materially from the changes captured in `previous`.
///
/// Reads and hashes local files; call from a blocking context.
pub fn has_material_changes(
    current: &[PendingChange],
    previous: &[PendingChange],
) -> ShelveResult<bool> {
    if previous.is_empty() || current.len() != previous.len() {
        return Ok(true);
    }

    let shelved: HashMap<&str, &PendingChange> = previous
        .iter()
        .map(|c| (c.server_item.as_str(), c))
        .collect();

    // Most recently touched first, so a differing item usually turns up early
    let mut ordered: Vec<&PendingChange> = current.iter().collect();
    ordered.sort_by(|a, b| b.last_change_date().cmp(&a.last_change_date()));

    for change in ordered {
        let Some(shelved_change) = shelved.get(change.server_item.as_str()) else {
            return Ok(true);
        };
        if current_fingerprint(change)? != shelved_change.upload_hash {
            return Ok(true);
        }
    }

    Ok(false)
}
