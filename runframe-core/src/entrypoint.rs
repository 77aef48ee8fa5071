//! Entrypoint selection for a file set without an explicit entrypoint.

use crate::types::FileSnapshot;

/// Conventional entrypoint names, highest priority first.
pub const ENTRYPOINT_CANDIDATES: &[&str] = &[
    "index.tsx",
    "main.tsx",
    "index.ts",
    "main.ts",
    "index.circuit.tsx",
];

/// Pick the entrypoint for `snapshot`.
///
/// An explicit `configured` entrypoint always wins, even when it is absent
/// from the snapshot; the orchestrator reports that as a configuration error.
pub fn detect(snapshot: &FileSnapshot, configured: Option<&str>) -> Option<String> {
    if let Some(path) = configured {
        return Some(path.to_string());
    }
    if let Some(found) = ENTRYPOINT_CANDIDATES
        .iter()
        .find(|candidate| snapshot.contains(candidate))
    {
        return Some((*found).to_string());
    }
    snapshot
        .paths()
        .into_iter()
        .find(|path| path.ends_with(".tsx"))
        .map(str::to_string)
}
