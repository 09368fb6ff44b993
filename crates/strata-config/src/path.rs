//! Path helpers for configured locations.

use std::path::{Component, Path, PathBuf};

/// Expand a leading `~` to the home directory.
///
/// Paths without a leading `~`, and all paths when no home directory is
/// known, are returned unchanged. `~user` is not supported.
pub fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => match dirs::home_dir() {
            Some(home) => home.join(components.as_path()),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

/// Normalize path, falling back to the original if canonicalization fails.
///
/// This is useful when the path might not exist and that's acceptable.
pub fn normalize_or_original(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
