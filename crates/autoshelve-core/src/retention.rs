//! Retention of past shelvesets.

use crate::name;
use crate::types::Shelveset;

/// Entries of `history` beyond the first `maximum`.
///
/// `history` must be sorted newest-first. A `maximum` of 0 disables
/// retention and selects nothing.
pub fn select_for_purge(history: &[Shelveset], maximum: u16) -> &[Shelveset] {
    if maximum == 0 {
        return &[];
    }
    history.get(usize::from(maximum)..).unwrap_or(&[])
}

/// Engine-owned shelvesets in the same scope as `workspace_name`, newest first.
///
/// When `pattern` is workspace-scoped, only shelvesets whose name contains
/// the workspace name are kept.
pub fn past_shelvesets(
    all: Vec<Shelveset>,
    workspace_name: &str,
    pattern: &str,
) -> Vec<Shelveset> {
    let scoped = name::is_workspace_scoped(pattern);

    let mut history: Vec<Shelveset> = all
        .into_iter()
        .filter(|s| s.is_engine_owned())
        .filter(|s| !scoped || s.name.contains(workspace_name))
        .collect();

    history.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));
    history
}
