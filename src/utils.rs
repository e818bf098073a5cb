//! Utility functions

use crate::error::{IngestError, Result};

/// Normalize an internal container path.
///
/// Backslashes become forward slashes, empty segments are dropped.
pub fn normalize_path(path: &str) -> Result<String> {
    let replaced = path.replace('\\', "/");
    let segments: Vec<&str> = replaced
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.iter().any(|s| *s == "..") {
        return Err(IngestError::Configuration(format!(
            "Internal path may not contain '..': {path}"
        )));
    }
    if segments.is_empty() {
        return Err(IngestError::Configuration(format!(
            "Empty internal path: '{path}'"
        )));
    }
    Ok(segments.join("/"))
}

/// Join a normalized node path and an object name
pub fn join_key(node: &str, name: &str) -> String {
    if node.is_empty() {
        name.to_string()
    } else {
        format!("{node}/{name}")
    }
}

/// Every proper ancestor of a normalized path, outermost first
pub fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/').map(|(i, _)| &path[..i]).collect()
}

/// Object key of a chunk relative to its dataset
pub fn chunk_key(coords: &[usize]) -> String {
    let index = coords
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(".");
    format!("c/{index}")
}

/// Integer completion percentage
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        (100 * done.min(total) / total) as u8
    }
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
